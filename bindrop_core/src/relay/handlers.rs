use super::Relay;
use crate::flow::FlowSender;
use crate::protocol::{
    CodeCheck, CodeCheckReply, HandshakeRelay, Identify, IdentifyReply, Message, TransferOffer,
};
use crate::store::FileUnit;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Relay {
    pub(super) async fn handle_message(
        self: &Arc<Self>,
        id: u64,
        flow: &FlowSender,
        kill: &CancellationToken,
        msg: Message,
    ) {
        if let Message::Identify(Identify { peer_id }) = msg {
            self.on_identify(id, flow, &peer_id).await;
            return;
        }

        let identity = {
            let state = self.state.lock().await;
            state
                .get(id)
                .filter(|s| s.is_identified())
                .map(|s| (s.peer_id.clone(), s.code.clone()))
        };
        let Some((peer_id, code)) = identity else {
            debug!(session = id, kind = msg.name(), "Ignoring message before identify");
            return;
        };

        match msg {
            Message::CodeCheck(check) => self.on_code_check(id, flow, check).await,
            Message::HandshakeRelay(relay) => self.on_handshake(id, &peer_id, &code, relay).await,
            Message::TransferChunk(unit) => self.on_upload(id, &peer_id, unit).await,
            Message::TransferOffer(offer) => self.on_client_offer(id, &peer_id, offer).await,
            Message::TransferAccept(accept) => {
                let file_ids = self.state.lock().await.begin_drain(accept.file_ids);
                if file_ids.is_empty() {
                    debug!(session = id, "Accepted transfers are already being delivered");
                    return;
                }
                let relay = self.clone();
                let flow = flow.clone();
                let kill = kill.clone();
                tokio::spawn(async move {
                    relay.drain(id, code, flow, kill, file_ids).await;
                });
            }
            Message::TransferReject(reject) => {
                for uid in reject.file_ids {
                    self.on_reject(id, &code, &uid).await;
                }
            }
            Message::Unknown { kind } => {
                warn!(session = id, kind, "Dropping unknown message kind");
            }
            other => {
                debug!(session = id, kind = other.name(), "Unexpected message from client");
            }
        }
    }

    async fn on_identify(&self, id: u64, flow: &FlowSender, peer_id: &str) {
        let code = self.state.lock().await.identify(id, peer_id);
        let reply = match code {
            Some(code) => {
                info!(session = id, code = %code, "Client identified");
                IdentifyReply {
                    code,
                    allowed: true,
                    target_length: self.target_length,
                }
            }
            None => {
                warn!(session = id, "Refusing identify");
                IdentifyReply {
                    code: String::new(),
                    allowed: false,
                    target_length: self.target_length,
                }
            }
        };
        flow.send(Message::IdentifyReply(reply));
    }

    async fn on_code_check(&self, id: u64, flow: &FlowSender, check: CodeCheck) {
        let owner = self
            .state
            .lock()
            .await
            .resolve_code(id, &check.code)
            .map(|s| s.peer_id.clone());
        debug!(session = id, code = %check.code, valid = owner.is_some(), "Code check");
        flow.send(Message::CodeCheckReply(CodeCheckReply {
            code: check.code,
            valid: owner.is_some(),
            owner_id: owner.unwrap_or_default(),
        }));
    }

    async fn on_handshake(&self, id: u64, peer_id: &str, code: &str, mut relay: HandshakeRelay) {
        let target = self
            .state
            .lock()
            .await
            .by_peer_id(&relay.target_id)
            .filter(|s| s.id != id)
            .and_then(|s| s.flow.clone());
        let Some(target) = target else {
            debug!(session = id, "Handshake target not connected");
            return;
        };
        relay.sender_code = code.to_string();
        relay.sender_id = peer_id.to_string();
        target.send(Message::HandshakeRelay(relay));
    }

    async fn on_upload(&self, id: u64, peer_id: &str, mut unit: FileUnit) {
        unit.sender_id = peer_id.to_string();
        let uid = unit.file_id.clone();

        let existing = self.store.record(&uid).await;
        if let Some(record) = &existing
            && record.sender_id != unit.sender_id
        {
            warn!(session = id, file_id = %uid, "Chunk for a transfer owned by another sender");
            return;
        }
        let was_finished = existing.is_some_and(|r| r.finished);

        if let Err(e) = self.store.flush(&unit).await {
            warn!(session = id, file_id = %uid, error = %e, "Failed to store chunk");
            return;
        }
        if !was_finished && self.store.is_finished(&uid).await {
            self.offer_stored(&uid).await;
        }
    }

    /// Tell the target of a finished upload that it is waiting
    async fn offer_stored(&self, uid: &str) {
        let Some(record) = self.store.record(uid).await else {
            return;
        };
        let (Some(name), Some(size)) = (record.name, record.size) else {
            warn!(file_id = %uid, "Finished transfer has no metadata, not offering");
            return;
        };
        let target = self
            .state
            .lock()
            .await
            .by_code(&record.target_code)
            .and_then(|s| s.flow.clone());
        let Some(target) = target else {
            info!(file_id = %uid, code = %record.target_code, "Target not connected, transfer stays stored");
            return;
        };
        info!(file_id = %uid, code = %record.target_code, "Offering transfer");
        target.send(Message::TransferOffer(TransferOffer {
            target_code: record.target_code,
            sender_id: record.sender_id,
            file_id: record.file_id,
            name,
            size,
            archived: record.archived,
        }));
    }

    async fn on_client_offer(&self, id: u64, peer_id: &str, mut offer: TransferOffer) {
        let target = self
            .state
            .lock()
            .await
            .resolve_code(id, &offer.target_code)
            .and_then(|s| s.flow.clone());
        let Some(target) = target else {
            debug!(session = id, code = %offer.target_code, "Offer for unknown code dropped");
            return;
        };
        offer.sender_id = peer_id.to_string();
        target.send(Message::TransferOffer(offer));
    }

    async fn on_reject(&self, id: u64, code: &str, uid: &str) {
        let Some(record) = self.store.record(uid).await else {
            debug!(session = id, file_id = %uid, "Reject for unknown transfer");
            return;
        };
        if record.target_code != code {
            warn!(session = id, file_id = %uid, "Reject from a session that is not the target");
            return;
        }
        if self.state.lock().await.is_draining(uid) {
            warn!(session = id, file_id = %uid, "Reject for a transfer already being delivered");
            return;
        }
        if self.store.remove_completely(uid).await {
            info!(file_id = %uid, "Transfer rejected and removed");
        } else {
            warn!(file_id = %uid, "Transfer rejected but removal was incomplete");
        }
    }

    /// Hand each accepted transfer to the receiver one chunk at a time. A
    /// chunk leaves the store once it has been written to the session.
    /// `file_ids` were claimed with `begin_drain` and are released here.
    async fn drain(
        self: Arc<Self>,
        id: u64,
        code: String,
        flow: FlowSender,
        kill: CancellationToken,
        file_ids: Vec<String>,
    ) {
        let mut pending = file_ids.iter();
        for uid in pending.by_ref() {
            let receiver_alive = self.drain_one(id, &code, &flow, &kill, uid).await;
            self.state.lock().await.end_drain(uid);
            if !receiver_alive {
                break;
            }
        }
        let mut state = self.state.lock().await;
        for uid in pending {
            state.end_drain(uid);
        }
    }

    /// Deliver one transfer. Returns false once the receiver is gone.
    async fn drain_one(
        &self,
        id: u64,
        code: &str,
        flow: &FlowSender,
        kill: &CancellationToken,
        uid: &str,
    ) -> bool {
        let Some(record) = self.store.record(uid).await else {
            debug!(session = id, file_id = %uid, "Accept for unknown transfer");
            return true;
        };
        if record.target_code != code {
            warn!(session = id, file_id = %uid, "Accept from a session that is not the target");
            return true;
        }
        if !record.finished {
            warn!(session = id, file_id = %uid, "Transfer not finished yet, skipping");
            return true;
        }

        for index in 0..record.total {
            if kill.is_cancelled() {
                return false;
            }
            let unit = match self.store.read_chunk(uid, index).await {
                Ok(Some(unit)) => unit,
                Ok(None) => {
                    // Never hand out a truncated transfer
                    warn!(file_id = %uid, index, "Chunk missing from finished transfer, stopping");
                    return true;
                }
                Err(e) => {
                    warn!(file_id = %uid, index, error = %e, "Failed to read chunk");
                    return true;
                }
            };
            if !flow.send(Message::TransferChunk(unit)).delivered().await {
                debug!(session = id, file_id = %uid, "Receiver gone, stopping delivery");
                return false;
            }
            self.store.remove_chunk(uid, index).await;
        }
        info!(session = id, file_id = %uid, total = record.total, "Transfer delivered");
        true
    }
}
