//! Client protocol engine.
//!
//! Drives one relay session: identify, resolve codes, run handshakes, send
//! and receive transfers. Everything the embedding layer needs to know is
//! reported as a [`ClientEvent`] on the channel handed to [`Client::connect`].

mod inbound;
mod outbound;
mod sink;

pub use sink::{DownloadDirSink, FileSink};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::flow::FlowSender;
use crate::handshake::HandshakeTable;
use crate::protocol::{CodeCheck, Identify, Message, TransferAccept, TransferReject};
use crate::store::TransferStore;
use crate::transport::{self, Session};
use crate::worker::WorkerPool;
use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

/// Files below this size are encrypted in one piece in memory
pub const IN_MEMORY_THRESHOLD: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The relay assigned our code
    Connected { code: String, target_length: u32 },
    CodeChecked { code: String, valid: bool },
    HandshakeComplete { code: String, peer_id: String },
    CodeInvalidated { code: String },
    OfferReceived {
        file_id: String,
        name: String,
        size: u64,
        archived: bool,
    },
    TransferSent { file_id: String, name: String },
    TransferCompleted { file_id: String, path: PathBuf },
    Error(String),
    Disconnected,
}

/// An offer we decrypted and have not answered yet
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub sender_id: String,
    pub name: String,
    pub size: u64,
    pub archived: bool,
}

#[derive(Default)]
struct ClientState {
    code: String,
    /// 0 until the identify reply arrived
    target_length: u32,
    handshakes: HandshakeTable,
    /// Codes we learned, mapped to the peer id behind them
    code_peers: HashMap<String, String>,
    offers: HashMap<String, PendingOffer>,
}

struct Inner {
    config: ClientConfig,
    flow: FlowSender,
    connection: quinn::Connection,
    events: mpsc::Sender<ClientEvent>,
    state: Mutex<ClientState>,
    store: TransferStore,
    pool: WorkerPool,
    sink: Arc<dyn FileSink>,
    local_target: u32,
    in_memory_limit: AtomicU64,
}

impl Inner {
    async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

pub struct ClientHandle {
    pub client: Client,
    reader: JoinHandle<()>,
    _endpoint: quinn::Endpoint,
}

impl ClientHandle {
    /// Resolves once the session has ended
    pub async fn closed(self) {
        let _ = self.reader.await;
    }
}

impl Client {
    /// Connect to the configured relay and identify. The code arrives
    /// later as [`ClientEvent::Connected`].
    pub async fn connect(
        config: ClientConfig,
        sink: Arc<dyn FileSink>,
        events: mpsc::Sender<ClientEvent>,
    ) -> anyhow::Result<ClientHandle> {
        let addr = transport::resolve(&config.host, config.port).await?;
        let endpoint = transport::make_client_endpoint()?;
        let Session {
            connection,
            send,
            recv,
        } = transport::connect(&endpoint, addr).await?;
        info!(relay = %addr, "Connected to relay");

        let store = TransferStore::open(config.workspace_dir.join("incoming"))
            .await
            .context("Failed to open client store")?;
        let (flow, _writer) = FlowSender::spawn(send, "relay");
        let local_target = config.buffer_sizes().target_length();

        let inner = Arc::new(Inner {
            flow,
            connection,
            events,
            state: Mutex::new(ClientState::default()),
            store,
            pool: WorkerPool::default_sized(),
            sink,
            local_target,
            in_memory_limit: AtomicU64::new(IN_MEMORY_THRESHOLD),
            config,
        });

        inner.flow.send(Message::Identify(Identify {
            peer_id: inner.config.local_identifier.clone(),
        }));

        let reader = tokio::spawn(inbound::read_loop(inner.clone(), recv));
        Ok(ClientHandle {
            client: Client { inner },
            reader,
            _endpoint: endpoint,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.config.local_identifier
    }

    /// Our relay-assigned code, once known
    pub async fn code(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        (!state.code.is_empty()).then(|| state.code.clone())
    }

    /// Negotiated chunk length, once known
    pub async fn target_length(&self) -> Option<u32> {
        let state = self.inner.state.lock().await;
        (state.target_length > 0).then_some(state.target_length)
    }

    /// Files at or above `limit` bytes are streamed and encrypted chunk by chunk
    pub fn set_in_memory_limit(&self, limit: u64) {
        self.inner.in_memory_limit.store(limit, Ordering::Relaxed);
    }

    /// Ask the relay who holds `code`. A valid answer starts a handshake.
    pub fn check_code(&self, code: &str) {
        self.inner.flow.send(Message::CodeCheck(CodeCheck {
            code: code.to_string(),
        }));
    }

    pub async fn is_paired(&self, code: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .code_peers
            .get(code)
            .is_some_and(|peer| state.handshakes.is_complete(peer))
    }

    pub async fn pending_offers(&self) -> HashMap<String, PendingOffer> {
        self.inner.state.lock().await.offers.clone()
    }

    /// Encrypt and upload a file or folder for the peer behind `code`.
    /// Returns the new file id once everything was written to the relay.
    pub async fn send_path(&self, code: &str, path: impl Into<PathBuf>) -> Result<String, ClientError> {
        outbound::send_path(&self.inner, code, path.into()).await
    }

    pub fn accept(&self, file_ids: Vec<String>) {
        self.inner
            .flow
            .send(Message::TransferAccept(TransferAccept { file_ids }));
    }

    pub async fn reject(&self, file_ids: Vec<String>) {
        {
            let mut state = self.inner.state.lock().await;
            for uid in &file_ids {
                state.offers.remove(uid);
            }
        }
        self.inner
            .flow
            .send(Message::TransferReject(TransferReject { file_ids }));
    }

    /// Say goodbye and close the connection
    pub async fn disconnect(&self) {
        self.inner.flow.send(Message::Disconnect);
        let _ = tokio::time::timeout(Duration::from_secs(1), self.inner.flow.wait_idle()).await;
        self.inner.connection.close(0u32.into(), b"bye");
    }
}
