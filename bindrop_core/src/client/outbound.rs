use super::{ClientEvent, Inner};
use crate::archive::create_tar_archive;
use crate::codes::generate_file_id;
use crate::crypto::{CipherParams, EncryptedPayload, SharedKey, TAG_SIZE};
use crate::error::ClientError;
use crate::protocol::Message;
use crate::store::FileUnit;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// What every unit of one transfer shares
struct Outgoing {
    file_id: String,
    target_code: String,
    name: EncryptedPayload,
    size: EncryptedPayload,
    archived: bool,
}

impl Outgoing {
    fn unit(
        &self,
        index: u32,
        total: u32,
        content: Bytes,
        params: Option<CipherParams>,
    ) -> FileUnit {
        let first = index == 0;
        FileUnit {
            file_id: self.file_id.clone(),
            sender_id: String::new(),
            target_code: self.target_code.clone(),
            name: first.then(|| self.name.clone()),
            size: first.then(|| self.size.clone()),
            archived: self.archived,
            index,
            total,
            final_chunk: index + 1 == total,
            content,
            params,
        }
    }
}

pub(super) async fn send_path(
    inner: &Inner,
    code: &str,
    path: PathBuf,
) -> Result<String, ClientError> {
    let (key, target_length) = {
        let state = inner.state.lock().await;
        if state.target_length == 0 {
            return Err(ClientError::NotConnected);
        }
        let peer = state
            .code_peers
            .get(code)
            .ok_or_else(|| ClientError::UnknownCode(code.to_string()))?;
        let key = state
            .handshakes
            .key(peer)
            .ok_or_else(|| ClientError::HandshakeIncomplete(code.to_string()))?;
        (key, state.target_length as usize)
    };
    if !path.exists() {
        return Err(ClientError::MissingPath(path));
    }

    // The temp archive lives until the upload is done
    let (source, name, archived, size, _archive) = if path.is_dir() {
        let folder = path.clone();
        let work_dir = inner.config.workspace_dir.join("outgoing");
        let archive = inner
            .pool
            .run(move || create_tar_archive(&folder, &work_dir))
            .await??;
        let source = archive.file.path().to_path_buf();
        let name = archive.name.clone();
        (source, name, true, archive.size, Some(archive))
    } else {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown_file".to_string());
        let size = tokio::fs::metadata(&path).await?.len();
        (path.clone(), name, false, size, None)
    };

    let outgoing = Outgoing {
        file_id: generate_file_id(),
        target_code: code.to_string(),
        name: key.encrypt(name.as_bytes())?,
        size: key.encrypt(size.to_string().as_bytes())?,
        archived,
    };

    info!(
        file_id = %outgoing.file_id,
        code = %code,
        size,
        archived,
        "Sending"
    );

    if size < inner.in_memory_limit.load(Ordering::Relaxed) {
        send_in_memory(inner, &key, &outgoing, &source, target_length).await?;
    } else {
        send_streamed(inner, &key, &outgoing, &source, size, target_length).await?;
    }

    inner
        .emit(ClientEvent::TransferSent {
            file_id: outgoing.file_id.clone(),
            name,
        })
        .await;
    Ok(outgoing.file_id)
}

/// Encrypt once. Send whole when it fits, else as equal ciphertext slices
/// where only the first carries params.
async fn send_in_memory(
    inner: &Inner,
    key: &SharedKey,
    outgoing: &Outgoing,
    source: &Path,
    target_length: usize,
) -> Result<(), ClientError> {
    let plain = tokio::fs::read(source).await?;
    let k = key.clone();
    let sealed = inner.pool.run(move || k.encrypt(&plain)).await??;

    let units: Vec<Message> = if sealed.len() <= target_length {
        vec![Message::TransferChunk(outgoing.unit(
            0,
            1,
            sealed.ciphertext,
            Some(sealed.params),
        ))]
    } else {
        let total = sealed.len().div_ceil(target_length) as u32;
        (0..total)
            .map(|i| {
                let start = i as usize * target_length;
                let end = (start + target_length).min(sealed.len());
                let params = (i == 0).then_some(sealed.params);
                Message::TransferChunk(outgoing.unit(
                    i,
                    total,
                    sealed.ciphertext.slice(start..end),
                    params,
                ))
            })
            .collect()
    };

    debug!(file_id = %outgoing.file_id, units = units.len(), "Encrypted once");
    if !inner.flow.enqueue(units).delivered().await {
        return Err(ClientError::NotConnected);
    }
    Ok(())
}

/// Read, encrypt and send one chunk at a time; only one chunk is ever in
/// memory. Every chunk carries its own params.
async fn send_streamed(
    inner: &Inner,
    key: &SharedKey,
    outgoing: &Outgoing,
    source: &Path,
    size: u64,
    target_length: usize,
) -> Result<(), ClientError> {
    let limit = inner.in_memory_limit.load(Ordering::Relaxed).max(1) as usize;
    let chunk_len = limit.min(target_length.saturating_sub(TAG_SIZE)).max(1);
    let total = size.div_ceil(chunk_len as u64).max(1) as u32;

    let mut file = tokio::fs::File::open(source).await?;
    let mut remaining = size;
    for index in 0..total {
        let len = remaining.min(chunk_len as u64) as usize;
        let mut plain = vec![0u8; len];
        file.read_exact(&mut plain).await?;
        remaining -= len as u64;

        let k = key.clone();
        let sealed = inner.pool.run(move || k.encrypt(&plain)).await??;
        let unit = outgoing.unit(index, total, sealed.ciphertext, Some(sealed.params));
        if !inner.flow.send(Message::TransferChunk(unit)).delivered().await {
            return Err(ClientError::NotConnected);
        }
    }
    debug!(file_id = %outgoing.file_id, total, "Encrypted each chunk");
    Ok(())
}
