use super::{ClientEvent, Inner, PendingOffer};
use crate::archive::extract_tar_archive;
use crate::config::negotiate_target;
use crate::crypto::{EncryptedPayload, SharedKey};
use crate::error::{ClientError, CryptoError, StoreError, TransportError};
use crate::handshake::HandshakeAction;
use crate::protocol::{
    CodeCheckReply, CodeInvalidated, HandshakeRelay, IdentifyReply, Inbound, Message,
    TransferOffer, recv_msg,
};
use crate::store::FileUnit;
use crate::utils::{open_secure_file, sanitize_file_name};
use anyhow::Context;
use bytes::Bytes;
use quinn::RecvStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub(super) async fn read_loop(inner: Arc<Inner>, mut recv: RecvStream) {
    loop {
        match recv_msg(&mut recv).await {
            Ok(Inbound::Message(Message::Disconnect)) => {
                info!("Relay closed the session");
                break;
            }
            Ok(Inbound::Message(msg)) => handle(&inner, msg).await,
            Ok(Inbound::Invalid(e)) => warn!(error = %e, "Dropping invalid frame"),
            Err(TransportError::Closed) => break,
            Err(e) => {
                debug!(error = %e, "Relay stream failed");
                break;
            }
        }
    }
    inner.connection.close(0u32.into(), b"bye");
    inner.emit(ClientEvent::Disconnected).await;
}

async fn handle(inner: &Arc<Inner>, msg: Message) {
    match msg {
        Message::IdentifyReply(reply) => on_identify_reply(inner, reply).await,
        Message::CodeCheckReply(reply) => on_code_check_reply(inner, reply).await,
        Message::HandshakeRelay(relay) => on_handshake(inner, relay).await,
        Message::CodeInvalidated(CodeInvalidated { code }) => on_code_invalidated(inner, code).await,
        Message::TransferOffer(offer) => on_offer(inner, offer).await,
        Message::TransferChunk(unit) => {
            let file_id = unit.file_id.clone();
            if let Err(e) = on_chunk(inner, unit).await {
                warn!(file_id = %file_id, error = %e, "Transfer failed");
                inner
                    .emit(ClientEvent::Error(format!("transfer {} failed: {}", file_id, e)))
                    .await;
            }
        }
        Message::Unknown { kind } => warn!(kind, "Dropping unknown message kind"),
        other => debug!(kind = other.name(), "Unexpected message from relay"),
    }
}

async fn on_identify_reply(inner: &Inner, reply: IdentifyReply) {
    if !reply.allowed {
        warn!("Relay refused our identify");
        inner
            .emit(ClientEvent::Error("relay refused identify".to_string()))
            .await;
        return;
    }
    let target_length = {
        let mut state = inner.state.lock().await;
        state.code = reply.code.clone();
        if state.target_length == 0 {
            state.target_length = negotiate_target(inner.local_target, reply.target_length);
        }
        state.target_length
    };
    info!(code = %reply.code, target_length, "Identified with relay");
    inner
        .emit(ClientEvent::Connected {
            code: reply.code,
            target_length,
        })
        .await;
}

async fn on_code_check_reply(inner: &Inner, reply: CodeCheckReply) {
    if !reply.valid {
        inner
            .emit(ClientEvent::CodeChecked {
                code: reply.code,
                valid: false,
            })
            .await;
        return;
    }

    let (public_key, complete) = {
        let mut state = inner.state.lock().await;
        state
            .code_peers
            .insert(reply.code.clone(), reply.owner_id.clone());
        let public_key = state.handshakes.initiate(&reply.owner_id);
        (public_key, state.handshakes.is_complete(&reply.owner_id))
    };

    inner
        .emit(ClientEvent::CodeChecked {
            code: reply.code.clone(),
            valid: true,
        })
        .await;

    if let Some(public_key) = public_key {
        debug!(code = %reply.code, "Starting handshake");
        inner.flow.send(Message::HandshakeRelay(HandshakeRelay {
            target_id: reply.owner_id,
            sender_code: String::new(),
            sender_id: String::new(),
            public_key: Bytes::from(public_key),
        }));
    } else if complete {
        inner
            .emit(ClientEvent::HandshakeComplete {
                code: reply.code,
                peer_id: reply.owner_id,
            })
            .await;
    }
}

async fn on_handshake(inner: &Inner, relay: HandshakeRelay) {
    let action = {
        let mut state = inner.state.lock().await;
        if !relay.sender_code.is_empty() {
            state
                .code_peers
                .insert(relay.sender_code.clone(), relay.sender_id.clone());
        }
        state.handshakes.receive(&relay.sender_id, &relay.public_key)
    };

    match action {
        HandshakeAction::Reply(public_key) => {
            inner.flow.send(Message::HandshakeRelay(HandshakeRelay {
                target_id: relay.sender_id.clone(),
                sender_code: String::new(),
                sender_id: String::new(),
                public_key: Bytes::from(public_key),
            }));
        }
        HandshakeAction::Completed => {}
        HandshakeAction::Ignored => {
            debug!(code = %relay.sender_code, "Handshake already complete, ignoring key");
            return;
        }
        HandshakeAction::Failed(e) => {
            warn!(code = %relay.sender_code, error = %e, "Handshake failed");
            inner
                .emit(ClientEvent::Error(format!(
                    "handshake with {} failed: {}",
                    relay.sender_code, e
                )))
                .await;
            return;
        }
    }

    info!(code = %relay.sender_code, "Handshake complete");
    inner
        .emit(ClientEvent::HandshakeComplete {
            code: relay.sender_code,
            peer_id: relay.sender_id,
        })
        .await;
}

async fn on_code_invalidated(inner: &Inner, code: String) {
    let known = {
        let mut state = inner.state.lock().await;
        match state.code_peers.remove(&code) {
            Some(peer) => {
                state.handshakes.forget(&peer);
                true
            }
            None => false,
        }
    };
    if known {
        info!(code = %code, "Peer went away");
        inner.emit(ClientEvent::CodeInvalidated { code }).await;
    }
}

async fn key_for(inner: &Inner, sender_id: &str) -> Result<SharedKey, CryptoError> {
    inner
        .state
        .lock()
        .await
        .handshakes
        .key(sender_id)
        .ok_or_else(|| CryptoError::NoSecret(sender_id.to_string()))
}

async fn on_offer(inner: &Inner, offer: TransferOffer) {
    let decoded = async {
        let key = key_for(inner, &offer.sender_id).await?;
        let name = key.decrypt_string(&offer.name)?;
        let size = key
            .decrypt_string(&offer.size)?
            .parse::<u64>()
            .map_err(|_| CryptoError::Decrypt)?;
        Ok::<_, CryptoError>((name, size))
    }
    .await;

    let (name, size) = match decoded {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(file_id = %offer.file_id, error = %e, "Cannot read offer");
            inner
                .emit(ClientEvent::Error(format!("unreadable offer {}: {}", offer.file_id, e)))
                .await;
            return;
        }
    };

    info!(file_id = %offer.file_id, name = %name, size, "Offer received");
    inner.state.lock().await.offers.insert(
        offer.file_id.clone(),
        PendingOffer {
            sender_id: offer.sender_id,
            name: name.clone(),
            size,
            archived: offer.archived,
        },
    );
    inner
        .emit(ClientEvent::OfferReceived {
            file_id: offer.file_id,
            name,
            size,
            archived: offer.archived,
        })
        .await;
}

/// Name for a finished transfer: from the offer, else from the unit itself
async fn resolve_name(
    inner: &Inner,
    key: &SharedKey,
    file_id: &str,
    name: Option<&EncryptedPayload>,
) -> String {
    if let Some(offer) = inner.state.lock().await.offers.remove(file_id) {
        return offer.name;
    }
    name.and_then(|n| key.decrypt_string(n).ok())
        .unwrap_or_else(|| file_id.to_string())
}

async fn on_chunk(inner: &Arc<Inner>, unit: FileUnit) -> Result<(), ClientError> {
    let key = key_for(inner, &unit.sender_id).await?;

    if unit.is_whole() {
        let params = unit.params.ok_or(CryptoError::MissingParams)?;
        let content = unit.content.clone();
        let decrypt_key = key.clone();
        let plain = inner
            .pool
            .run(move || decrypt_key.decrypt_with(&content, &params))
            .await??;
        let name = resolve_name(inner, &key, &unit.file_id, unit.name.as_ref()).await;
        let mut output = Output::create(inner, &unit.file_id, &name, unit.archived).await?;
        if let Err(e) = output.write(&plain).await {
            output.discard().await;
            return Err(e);
        }
        let path = output.finish(inner, &unit.file_id).await?;
        return finish(inner, unit.file_id, path).await;
    }

    let uid = unit.file_id.clone();
    inner.store.flush(&unit).await?;
    if !inner.store.is_finished(&uid).await {
        debug!(file_id = %uid, index = unit.index, total = unit.total, "Chunk stored");
        return Ok(());
    }

    // The stored chunks go whether or not they could be written out
    let received = receive_stored(inner, &key, &uid).await;
    if !inner.store.remove_completely(&uid).await {
        warn!(file_id = %uid, "Could not clean up stored transfer");
    }
    finish(inner, uid, received?).await
}

/// Decrypt a finished split transfer from the store into its destination
async fn receive_stored(
    inner: &Arc<Inner>,
    key: &SharedKey,
    uid: &str,
) -> Result<PathBuf, ClientError> {
    let record = inner
        .store
        .record(uid)
        .await
        .ok_or_else(|| StoreError::Unknown(uid.to_string()))?;
    let name = resolve_name(inner, key, uid, record.name.as_ref()).await;

    let mut output = Output::create(inner, uid, &name, record.archived).await?;
    let written = if record.is_encrypted_each() {
        write_each(inner, key, uid, record.total, &mut output).await
    } else {
        write_once(inner, key, uid, &mut output).await
    };
    if let Err(e) = written {
        output.discard().await;
        return Err(e);
    }
    output.finish(inner, uid).await
}

/// One chunk in memory at a time
async fn write_each(
    inner: &Inner,
    key: &SharedKey,
    uid: &str,
    total: u32,
    output: &mut Output,
) -> Result<(), ClientError> {
    for index in 0..total {
        let chunk = inner
            .store
            .read_chunk(uid, index)
            .await?
            .ok_or_else(|| StoreError::Unknown(uid.to_string()))?;
        let params = chunk.params.ok_or(CryptoError::MissingParams)?;
        let k = key.clone();
        let plain = inner
            .pool
            .run(move || k.decrypt_with(&chunk.content, &params))
            .await??;
        output.write(&plain).await?;
    }
    Ok(())
}

async fn write_once(
    inner: &Inner,
    key: &SharedKey,
    uid: &str,
    output: &mut Output,
) -> Result<(), ClientError> {
    let whole = inner.store.reassemble(uid).await?;
    let params = whole.params.ok_or(CryptoError::MissingParams)?;
    let k = key.clone();
    let plain = inner
        .pool
        .run(move || k.decrypt_with(&whole.content, &params))
        .await??;
    output.write(&plain).await
}

async fn finish(inner: &Inner, file_id: String, path: PathBuf) -> Result<(), ClientError> {
    info!(file_id = %file_id, path = %path.display(), "Transfer received");
    inner
        .emit(ClientEvent::TransferCompleted { file_id, path })
        .await;
    Ok(())
}

/// Decrypted content on its way to disk. A plain file is written straight to
/// the sink's destination. An archived folder goes to a tar in the workspace
/// and is unpacked next to that destination on `finish`.
struct Output {
    destination: PathBuf,
    write_path: PathBuf,
    name: String,
    archived: bool,
    file: File,
}

impl Output {
    async fn create(
        inner: &Inner,
        file_id: &str,
        name: &str,
        archived: bool,
    ) -> Result<Self, ClientError> {
        let destination = inner.sink.destination(file_id, name);
        let write_path = if archived {
            inner
                .config
                .workspace_dir
                .join(format!("{}.tar", file_id))
        } else {
            destination.clone()
        };
        if let Some(parent) = write_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = open_secure_file(&write_path).await?;
        Ok(Self {
            destination,
            write_path,
            name: name.to_string(),
            archived,
            file,
        })
    }

    async fn write(&mut self, piece: &[u8]) -> Result<(), ClientError> {
        self.file.write_all(piece).await?;
        Ok(())
    }

    /// Drop whatever was written so far
    async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.write_path).await {
            debug!(path = %self.write_path.display(), error = %e, "Could not remove partial output");
        }
    }

    async fn finish(mut self, inner: &Inner, file_id: &str) -> Result<PathBuf, ClientError> {
        if let Err(e) = self.file.flush().await {
            self.discard().await;
            return Err(e.into());
        }
        drop(self.file);
        if !self.archived {
            return Ok(self.destination);
        }

        let extract_dir = self
            .destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let archive = self.write_path.clone();
        let dir = extract_dir.clone();
        let skipped = inner
            .pool
            .run(move || extract_tar_archive(&archive, &dir))
            .await?
            .context("Failed to unpack folder");
        let _ = tokio::fs::remove_file(&self.write_path).await;
        let skipped = skipped?;
        if !skipped.is_empty() {
            warn!(file_id = %file_id, skipped = skipped.len(), "Some archive entries were skipped");
        }

        let folder = self.name.strip_suffix(".tar").unwrap_or(&self.name);
        Ok(extract_dir.join(sanitize_file_name(folder)))
    }
}
