#![allow(dead_code)]

use bindrop_core::relay::{self, RelayHandle};
use bindrop_core::{Client, ClientConfig, ClientEvent, ClientHandle, DownloadDirSink, RelayConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn relay_config(dir: &Path) -> RelayConfig {
    RelayConfig {
        bind_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        workspace_dir: dir.join("relay"),
        ..RelayConfig::default()
    }
}

pub async fn start_relay(dir: &Path) -> RelayHandle {
    init_tracing();
    relay::start(relay_config(dir)).await.unwrap()
}

pub struct TestClient {
    pub handle: ClientHandle,
    pub events: mpsc::Receiver<ClientEvent>,
    pub downloads: PathBuf,
    pub code: String,
}

impl TestClient {
    pub fn client(&self) -> &Client {
        &self.handle.client
    }

    /// Wait for the first event matching `pred`, skipping others
    pub async fn expect<F>(&mut self, mut pred: F) -> ClientEvent
    where
        F: FnMut(&ClientEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("Timed out waiting for event")
                .expect("Event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }
}

/// Connect a client with its own workspace and wait for its code
pub async fn connect_client(addr: std::net::SocketAddr, dir: &Path, name: &str, multiplier: u32) -> TestClient {
    let root = dir.join(name);
    let downloads = root.join("downloads");
    let config = ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        buffer_size_multiplier: multiplier,
        local_identifier: bindrop_core::codes::generate_peer_id(),
        workspace_dir: root.join("work"),
        download_dir: downloads.clone(),
    };

    let (tx, events) = mpsc::channel(64);
    let sink = Arc::new(DownloadDirSink::new(&downloads));
    let handle = Client::connect(config, sink, tx).await.unwrap();

    let mut client = TestClient {
        handle,
        events,
        downloads,
        code: String::new(),
    };
    match client
        .expect(|e| matches!(e, ClientEvent::Connected { .. }))
        .await
    {
        ClientEvent::Connected { code, .. } => client.code = code,
        _ => unreachable!(),
    }
    client
}

/// `b` resolves `a`'s code; both sides end with a complete handshake
pub async fn pair(a: &mut TestClient, b: &mut TestClient) {
    b.client().check_code(&a.code);
    let a_code = a.code.clone();
    let b_code = b.code.clone();
    b.expect(|e| matches!(e, ClientEvent::HandshakeComplete { code, .. } if *code == a_code))
        .await;
    a.expect(|e| matches!(e, ClientEvent::HandshakeComplete { code, .. } if *code == b_code))
        .await;
    assert!(a.client().is_paired(&b.code).await);
    assert!(b.client().is_paired(&a.code).await);
}

/// Send `path` from `from` to `to`, accept it and return where it landed
pub async fn deliver(from: &mut TestClient, to: &mut TestClient, path: &Path) -> PathBuf {
    let file_id = from.client().send_path(&to.code, path).await.unwrap();

    let offered = file_id.clone();
    to.expect(|e| matches!(e, ClientEvent::OfferReceived { file_id, .. } if *file_id == offered))
        .await;
    to.client().accept(vec![file_id.clone()]);

    match to
        .expect(|e| matches!(e, ClientEvent::TransferCompleted { file_id: id, .. } if *id == file_id))
        .await
    {
        ClientEvent::TransferCompleted { path, .. } => path,
        _ => unreachable!(),
    }
}

/// Poll `check` until it holds or the event timeout passes
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
