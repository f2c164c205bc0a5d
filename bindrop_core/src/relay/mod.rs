//! Rendezvous relay.
//!
//! Every connection goes through `Connected -> Identified -> Closed`. The
//! relay hands out codes, forwards handshake keys by peer id, stores
//! uploaded chunks and drains them to the receiver on accept. It never
//! holds a key and never decrypts anything.

mod handlers;
mod state;

pub use state::{MAX_PEER_ID_LENGTH, PeerSession, RelayState};

use crate::config::RelayConfig;
use crate::error::TransportError;
use crate::flow::FlowSender;
use crate::protocol::{CodeInvalidated, Inbound, Message, recv_msg};
use crate::store::TransferStore;
use crate::transport::{Session, accept_session, make_server_endpoint};
use anyhow::{Context, Result};
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often identify deadlines are checked
const DEADLINE_CHECK: Duration = Duration::from_millis(250);

/// How often stale transfers are pruned
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Grace period for queued frames when a session ends
const LINGER: Duration = Duration::from_secs(1);

pub struct Relay {
    config: RelayConfig,
    state: Mutex<RelayState>,
    store: TransferStore,
    target_length: u32,
    next_id: AtomicU64,
}

impl Relay {
    pub async fn new(config: RelayConfig, state: RelayState) -> Result<Arc<Self>> {
        let store = TransferStore::open(&config.workspace_dir)
            .await
            .context("Failed to open relay store")?;
        let target_length = config.buffer_sizes().target_length();
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(state),
            store,
            target_length,
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn target_length(&self) -> u32 {
        self.target_length
    }

    pub fn store(&self) -> &TransferStore {
        &self.store
    }

    pub async fn live_codes(&self) -> Vec<String> {
        self.state.lock().await.live_codes()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, endpoint: Endpoint, shutdown: CancellationToken) {
        let scheduler = tokio::spawn(self.clone().run_scheduler(shutdown.clone()));

        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = endpoint.accept() => incoming,
            };
            let Some(incoming) = incoming else { break };

            let relay = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(connection) => connection,
                    Err(e) => {
                        debug!(error = %e, "Incoming connection failed");
                        return;
                    }
                };
                relay.run_session(connection, shutdown).await;
            });
        }

        endpoint.close(0u32.into(), b"relay shutting down");
        let _ = scheduler.await;
        info!("Relay stopped");
    }

    async fn run_session(self: Arc<Self>, connection: quinn::Connection, shutdown: CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kill = shutdown.child_token();
        self.state.lock().await.register(id, kill.clone());
        info!(session = id, remote = %connection.remote_address(), "Client connected");

        let opened = tokio::select! {
            _ = kill.cancelled() => Err(TransportError::Closed),
            opened = accept_session(connection.clone()) => opened,
        };
        let Session {
            connection,
            send,
            mut recv,
        } = match opened {
            Ok(session) => session,
            Err(e) => {
                debug!(session = id, error = %e, "Session stream never opened");
                self.disconnect(id).await;
                connection.close(0u32.into(), b"no session");
                return;
            }
        };

        let (flow, writer) = FlowSender::spawn(send, format!("session-{}", id));
        self.state.lock().await.attach_flow(id, flow.clone());

        loop {
            let inbound = tokio::select! {
                _ = kill.cancelled() => break,
                inbound = recv_msg(&mut recv) => inbound,
            };
            match inbound {
                Ok(Inbound::Message(Message::Disconnect)) => {
                    debug!(session = id, "Client asked to disconnect");
                    break;
                }
                Ok(Inbound::Message(msg)) => self.handle_message(id, &flow, &kill, msg).await,
                Ok(Inbound::Invalid(e)) => {
                    warn!(session = id, error = %e, "Dropping invalid frame");
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    debug!(session = id, error = %e, "Session read failed");
                    break;
                }
            }
        }

        kill.cancel();
        self.disconnect(id).await;
        drop(flow);
        let _ = tokio::time::timeout(LINGER, writer).await;
        let _ = tokio::time::timeout(LINGER, connection.closed()).await;
        connection.close(0u32.into(), b"bye");
    }

    /// Forget the session and tell everyone else its code is gone
    async fn disconnect(&self, id: u64) {
        let (code, others) = {
            let mut state = self.state.lock().await;
            let Some(session) = state.remove(id) else {
                return;
            };
            (session.code, state.identified_flows(id))
        };
        info!(session = id, code = %code, "Client disconnected");

        if code.is_empty() {
            return;
        }
        for flow in others {
            flow.send(Message::CodeInvalidated(CodeInvalidated { code: code.clone() }));
        }
    }

    async fn run_scheduler(self: Arc<Self>, shutdown: CancellationToken) {
        let mut deadlines = tokio::time::interval(DEADLINE_CHECK);
        deadlines.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut pruning = tokio::time::interval(PRUNE_INTERVAL);
        pruning.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let ttl = Duration::from_secs(self.config.transfer_ttl_secs);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = deadlines.tick() => self.enforce_identify_deadline().await,
                _ = pruning.tick() => {
                    let pruned = self.store.prune_older_than(ttl).await;
                    if pruned > 0 {
                        info!(pruned, "Pruned stale transfers");
                    }
                }
            }
        }
    }

    async fn enforce_identify_deadline(&self) {
        let timeout = Duration::from_millis(self.config.identify_timeout_ms);
        let state = self.state.lock().await;
        for id in state.overdue(timeout) {
            let Some(session) = state.get(id) else {
                continue;
            };
            if session.kill.is_cancelled() {
                continue;
            }
            warn!(session = id, "No identify before deadline, disconnecting");
            if let Some(flow) = &session.flow {
                flow.send(Message::Disconnect);
            }
            session.kill.cancel();
        }
    }
}

/// A relay running in the background
pub struct RelayHandle {
    pub addr: SocketAddr,
    pub relay: Arc<Relay>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl RelayHandle {
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }

    /// Resolves when the relay stops on its own or `shutdown` is called elsewhere
    pub async fn join(self) {
        let _ = self.task.await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Bind the configured address and serve in a background task
pub async fn start(config: RelayConfig) -> Result<RelayHandle> {
    let bind_addr = SocketAddr::new(config.bind_addr, config.port);
    let endpoint = make_server_endpoint(bind_addr)?;
    let addr = endpoint
        .local_addr()
        .map_err(|source| TransportError::Bind {
            addr: bind_addr,
            source,
        })?;

    let relay = Relay::new(config, RelayState::new()).await?;
    info!(
        addr = %addr,
        target_length = relay.target_length(),
        "Relay listening"
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(relay.clone().serve(endpoint, shutdown.clone()));
    Ok(RelayHandle {
        addr,
        relay,
        shutdown,
        task,
    })
}
