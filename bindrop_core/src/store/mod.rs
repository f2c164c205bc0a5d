//! Disk-backed chunk store keyed by file id.
//!
//! Layout under the store root:
//!
//! ```text
//! catalog.json        ordered list of known file ids
//! <uid>.json          TransferRecord
//! <uid>.bin           content of a whole (unsplit) transfer
//! <uid>_<index>.bin   content of chunk <index>
//! ```
//!
//! The files are the source of truth. Every operation on one uid runs under
//! that uid's lock, the catalog has a lock of its own.

mod atomic;
mod unit;

pub use unit::{FileUnit, TransferRecord};

use crate::error::StoreError;
use atomic::atomic_write;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CATALOG_FILE: &str = "catalog.json";

/// Longest file id accepted as a storage key
const MAX_ID_LENGTH: usize = 64;

pub struct TransferStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    catalog_lock: Mutex<()>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// File ids end up in file names, so only plain alphanumerics are allowed
fn check_uid(uid: &str) -> Result<(), StoreError> {
    if uid.is_empty() || uid.len() > MAX_ID_LENGTH || !uid.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(StoreError::InvalidId(uid.to_string()));
    }
    Ok(())
}

impl TransferStore {
    /// Open (and create if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&root, e))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
            catalog_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, uid: &str) -> PathBuf {
        self.root.join(format!("{}.json", uid))
    }

    fn blob_path(&self, uid: &str, index: u32, total: u32) -> PathBuf {
        if total == 1 {
            self.root.join(format!("{}.bin", uid))
        } else {
            self.root.join(format!("{}_{}.bin", uid, index))
        }
    }

    async fn lock_for(&self, uid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_record(&self, uid: &str) -> Result<Option<TransferRecord>, StoreError> {
        let path = self.record_path(uid);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                uid: uid.to_string(),
                reason: e.to_string(),
            })
    }

    async fn save_record(&self, record: &TransferRecord) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(record).map_err(|e| StoreError::Corrupt {
            uid: record.file_id.clone(),
            reason: e.to_string(),
        })?;
        atomic_write(&self.record_path(&record.file_id), &json).await
    }

    async fn load_catalog(&self) -> Result<Vec<String>, StoreError> {
        let path = self.root.join(CATALOG_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                uid: CATALOG_FILE.to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn save_catalog(&self, catalog: &[String]) -> Result<(), StoreError> {
        let json = serde_json::to_vec(catalog).map_err(|e| StoreError::Corrupt {
            uid: CATALOG_FILE.to_string(),
            reason: e.to_string(),
        })?;
        atomic_write(&self.root.join(CATALOG_FILE), &json).await
    }

    async fn catalog_insert(&self, uid: &str) -> Result<(), StoreError> {
        let _guard = self.catalog_lock.lock().await;
        let mut catalog = self.load_catalog().await?;
        if !catalog.iter().any(|id| id == uid) {
            catalog.push(uid.to_string());
            self.save_catalog(&catalog).await?;
        }
        Ok(())
    }

    async fn catalog_remove(&self, uid: &str) -> Result<(), StoreError> {
        let _guard = self.catalog_lock.lock().await;
        let mut catalog = self.load_catalog().await?;
        let before = catalog.len();
        catalog.retain(|id| id != uid);
        if catalog.len() != before {
            self.save_catalog(&catalog).await?;
        }
        Ok(())
    }

    /// Store one unit. The record is created on first sight of the uid and
    /// updated afterwards. An `Err` means the transfer must not be treated
    /// as finished.
    pub async fn flush(&self, unit: &FileUnit) -> Result<(), StoreError> {
        check_uid(&unit.file_id)?;
        let uid = unit.file_id.as_str();
        if unit.total == 0 || unit.index >= unit.total {
            return Err(StoreError::OutOfRange {
                uid: uid.to_string(),
                index: unit.index,
                total: unit.total,
            });
        }

        let lock = self.lock_for(uid).await;
        let _guard = lock.lock().await;

        let mut record = match self.load_record(uid).await? {
            Some(record) => {
                if record.total != unit.total {
                    return Err(StoreError::Corrupt {
                        uid: uid.to_string(),
                        reason: format!(
                            "chunk claims total {} but record has {}",
                            unit.total, record.total
                        ),
                    });
                }
                record
            }
            None => {
                self.catalog_insert(uid).await?;
                debug!(file_id = %uid, total = unit.total, "New transfer record");
                TransferRecord::new(unit, now_secs())
            }
        };

        let blob = self.blob_path(uid, unit.index, unit.total);
        tokio::fs::write(&blob, &unit.content)
            .await
            .map_err(|e| StoreError::io(&blob, e))?;

        let was_finished = record.finished;
        record.absorb(unit);
        self.save_record(&record).await?;

        if record.finished && !was_finished {
            info!(file_id = %uid, total = record.total, "Transfer complete in store");
        }
        Ok(())
    }

    pub async fn is_finished(&self, uid: &str) -> bool {
        matches!(self.record(uid).await, Some(r) if r.finished)
    }

    /// Total chunk count, `None` when the uid is unknown
    pub async fn length(&self, uid: &str) -> Option<u32> {
        self.record(uid).await.map(|r| r.total)
    }

    pub async fn has_whole(&self, uid: &str) -> bool {
        match self.record(uid).await {
            Some(r) if r.total == 1 => tokio::fs::try_exists(self.blob_path(uid, 0, 1))
                .await
                .unwrap_or(false),
            _ => false,
        }
    }

    pub async fn record(&self, uid: &str) -> Option<TransferRecord> {
        if check_uid(uid).is_err() {
            return None;
        }
        match self.load_record(uid).await {
            Ok(record) => record,
            Err(e) => {
                warn!(file_id = %uid, error = %e, "Failed to load transfer record");
                None
            }
        }
    }

    pub async fn has_catalog(&self, uid: &str) -> bool {
        let _guard = self.catalog_lock.lock().await;
        self.load_catalog()
            .await
            .map(|c| c.iter().any(|id| id == uid))
            .unwrap_or(false)
    }

    pub async fn all_ids(&self) -> Vec<String> {
        let _guard = self.catalog_lock.lock().await;
        self.load_catalog().await.unwrap_or_default()
    }

    pub async fn stored_count(&self, uid: &str) -> usize {
        self.record(uid).await.map(|r| r.stored_count()).unwrap_or(0)
    }

    pub async fn created_at(&self, uid: &str) -> Option<u64> {
        self.record(uid).await.map(|r| r.created_at)
    }

    pub async fn is_encrypted_each(&self, uid: &str) -> bool {
        self.record(uid)
            .await
            .map(|r| r.is_encrypted_each())
            .unwrap_or(false)
    }

    fn unit_from(&self, record: &TransferRecord, index: u32, content: Bytes) -> FileUnit {
        let first = index == 0;
        FileUnit {
            file_id: record.file_id.clone(),
            sender_id: record.sender_id.clone(),
            target_code: record.target_code.clone(),
            name: if first { record.name.clone() } else { None },
            size: if first { record.size.clone() } else { None },
            archived: record.archived,
            index,
            total: record.total,
            final_chunk: index + 1 == record.total,
            content,
            params: record.chunks.get(&index).copied().flatten(),
        }
    }

    async fn read_blob(
        &self,
        record: &TransferRecord,
        index: u32,
    ) -> Result<Option<Bytes>, StoreError> {
        if !record.chunks.contains_key(&index) {
            return Ok(None);
        }
        let path = self.blob_path(&record.file_id, index, record.total);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Stored chunk `index`, with the shared metadata attached to index 0
    pub async fn read_chunk(&self, uid: &str, index: u32) -> Result<Option<FileUnit>, StoreError> {
        check_uid(uid)?;
        let lock = self.lock_for(uid).await;
        let _guard = lock.lock().await;

        let Some(record) = self.load_record(uid).await? else {
            return Ok(None);
        };
        if index >= record.total {
            return Err(StoreError::OutOfRange {
                uid: uid.to_string(),
                index,
                total: record.total,
            });
        }
        Ok(self
            .read_blob(&record, index)
            .await?
            .map(|content| self.unit_from(&record, index, content)))
    }

    /// Only answers for unsplit transfers
    pub async fn read_whole(&self, uid: &str) -> Result<Option<FileUnit>, StoreError> {
        match self.length(uid).await {
            Some(1) => self.read_chunk(uid, 0).await,
            _ => Ok(None),
        }
    }

    /// Concatenate every chunk in index order into one whole-file unit.
    ///
    /// For encrypt-once transfers the unit carries the first chunk's params
    /// and decrypts as a single blob. For encrypt-each transfers `params` is
    /// `None`; use [`TransferStore::read_chunk`] and decrypt chunk by chunk.
    pub async fn reassemble(&self, uid: &str) -> Result<FileUnit, StoreError> {
        check_uid(uid)?;
        let lock = self.lock_for(uid).await;
        let _guard = lock.lock().await;

        let record = self
            .load_record(uid)
            .await?
            .ok_or_else(|| StoreError::Unknown(uid.to_string()))?;
        if !record.finished {
            return Err(StoreError::NotFinished(uid.to_string()));
        }

        let mut content = BytesMut::new();
        for index in 0..record.total {
            let blob = self.read_blob(&record, index).await?.ok_or_else(|| {
                StoreError::Corrupt {
                    uid: uid.to_string(),
                    reason: format!("chunk {} missing from finished transfer", index),
                }
            })?;
            content.extend_from_slice(&blob);
        }

        let mut unit = self.unit_from(&record, 0, content.freeze());
        unit.total = 1;
        unit.final_chunk = true;
        unit.params = if record.is_encrypted_each() {
            None
        } else {
            record.chunks.get(&0).copied().flatten()
        };
        Ok(unit)
    }

    /// Drop one chunk. Removing the last stored chunk (or the only slot of
    /// an unsplit transfer) removes the transfer completely.
    pub async fn remove_chunk(&self, uid: &str, index: u32) -> bool {
        if check_uid(uid).is_err() {
            return false;
        }
        let lock = self.lock_for(uid).await;
        let guard = lock.lock().await;

        let mut record = match self.load_record(uid).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                warn!(file_id = %uid, error = %e, "Cannot remove chunk");
                return false;
            }
        };

        if record.total == 1 {
            let ok = self.remove_files(uid).await;
            drop(guard);
            return self.forget(uid, ok).await;
        }

        if record.chunks.remove(&index).is_none() {
            return false;
        }
        let blob = self.blob_path(uid, index, record.total);
        if let Err(e) = tokio::fs::remove_file(&blob).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %blob.display(), error = %e, "Failed to delete chunk");
            return false;
        }

        if record.chunks.is_empty() {
            let ok = self.remove_files(uid).await;
            drop(guard);
            return self.forget(uid, ok).await;
        }

        match self.save_record(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(file_id = %uid, error = %e, "Failed to update record after chunk removal");
                false
            }
        }
    }

    /// Delete the catalog entry, every blob and the record. Returns false
    /// when the uid is unknown or any step failed; pieces already deleted
    /// stay deleted.
    pub async fn remove_completely(&self, uid: &str) -> bool {
        if check_uid(uid).is_err() {
            return false;
        }
        let known = self.has_catalog(uid).await;
        let lock = self.lock_for(uid).await;
        let guard = lock.lock().await;

        let has_record = tokio::fs::try_exists(self.record_path(uid))
            .await
            .unwrap_or(false);
        if !known && !has_record {
            return false;
        }
        let ok = self.remove_files(uid).await;
        drop(guard);
        self.forget(uid, ok).await
    }

    /// Remove every file that belongs to `uid`. Caller holds the uid lock.
    async fn remove_files(&self, uid: &str) -> bool {
        let mut ok = true;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cannot list store");
                return false;
            }
        };

        let chunk_prefix = format!("{}_", uid);
        let owned = |name: &str| {
            name == format!("{}.bin", uid)
                || name == format!("{}.json", uid)
                || name == format!("{}.tmp", uid)
                || name
                    .strip_prefix(&chunk_prefix)
                    .is_some_and(|rest| rest.ends_with(".bin") || rest.ends_with(".tmp"))
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read store entry");
                    ok = false;
                    break;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !owned(name) {
                continue;
            }
            if let Err(e) = tokio::fs::remove_file(entry.path()).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %entry.path().display(), error = %e, "Failed to delete");
                ok = false;
            }
        }
        ok
    }

    /// Drop the catalog entry and the lock slot after the files are gone
    async fn forget(&self, uid: &str, files_ok: bool) -> bool {
        let catalog_ok = match self.catalog_remove(uid).await {
            Ok(()) => true,
            Err(e) => {
                warn!(file_id = %uid, error = %e, "Failed to update catalog");
                false
            }
        };
        self.locks.lock().await.remove(uid);
        debug!(file_id = %uid, "Transfer removed");
        files_ok && catalog_ok
    }

    /// Remove transfers created at least `age` ago. Returns how many went.
    pub async fn prune_older_than(&self, age: Duration) -> usize {
        let now = now_secs();
        let mut removed = 0;
        for uid in self.all_ids().await {
            let Some(created) = self.created_at(&uid).await else {
                continue;
            };
            if now.saturating_sub(created) >= age.as_secs() && self.remove_completely(&uid).await {
                info!(file_id = %uid, "Pruned stale transfer");
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CipherParams, SharedKey};

    const UID: &str = "abcdefghijklmnopqrstuvwx";

    fn key() -> SharedKey {
        SharedKey::from_secret(&[42u8; 32]).unwrap()
    }

    fn chunk(index: u32, total: u32, content: &[u8], params: Option<CipherParams>) -> FileUnit {
        FileUnit {
            file_id: UID.to_string(),
            sender_id: "sender".to_string(),
            target_code: "AB12".to_string(),
            name: None,
            size: None,
            archived: false,
            index,
            total,
            final_chunk: index + 1 == total,
            content: Bytes::copy_from_slice(content),
            params,
        }
    }

    async fn open() -> (tempfile::TempDir, TransferStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TransferStore::open(dir.path().join("store")).await.unwrap();
        (dir, store)
    }

    fn residue(store: &TransferStore) -> Vec<String> {
        std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(UID))
            .collect()
    }

    #[tokio::test]
    async fn test_whole_unit_is_finished_immediately() {
        let (_dir, store) = open().await;
        let payload = key().encrypt(b"fifty bytes of something").unwrap();
        let mut unit = chunk(0, 1, &payload.ciphertext, Some(payload.params));
        unit.name = Some(key().encrypt(b"notes.txt").unwrap());

        store.flush(&unit).await.unwrap();
        assert!(store.is_finished(UID).await);
        assert!(store.has_whole(UID).await);
        assert_eq!(store.length(UID).await, Some(1));

        let whole = store.read_whole(UID).await.unwrap().unwrap();
        assert_eq!(whole.content, payload.ciphertext);
        assert_eq!(key().decrypt_string(whole.name.as_ref().unwrap()).unwrap(), "notes.txt");
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_finishes_on_last_gap() {
        let (_dir, store) = open().await;
        let k = key();
        let plain: Vec<&[u8]> = vec![b"one-", b"two-", b"three-", b"four"];
        let sealed: Vec<_> = plain.iter().map(|p| k.encrypt(p).unwrap()).collect();

        // Arrival order 3, 1, 4, 2 (1-based)
        for (step, idx) in [2u32, 0, 3, 1].into_iter().enumerate() {
            assert!(!store.is_finished(UID).await, "finished too early at step {}", step);
            let s = &sealed[idx as usize];
            store
                .flush(&chunk(idx, 4, &s.ciphertext, Some(s.params)))
                .await
                .unwrap();
        }
        assert!(store.is_finished(UID).await);
        assert!(store.is_encrypted_each(UID).await);

        let mut out = Vec::new();
        for i in 0..4 {
            let unit = store.read_chunk(UID, i).await.unwrap().unwrap();
            out.extend(k.decrypt_with(&unit.content, unit.params.as_ref().unwrap()).unwrap());
        }
        assert_eq!(out, b"one-two-three-four");
    }

    #[tokio::test]
    async fn test_finished_stays_true_once_reached() {
        let (_dir, store) = open().await;
        store.flush(&chunk(1, 2, b"b", None)).await.unwrap();
        assert!(!store.is_finished(UID).await);
        store.flush(&chunk(0, 2, b"a", None)).await.unwrap();
        assert!(store.is_finished(UID).await);

        // A duplicate delivery of a chunk changes nothing
        store.flush(&chunk(1, 2, b"b", None)).await.unwrap();
        assert!(store.is_finished(UID).await);
        assert_eq!(store.stored_count(UID).await, 2);
    }

    #[tokio::test]
    async fn test_reassemble_encrypt_once() {
        let (_dir, store) = open().await;
        let k = key();
        let original: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let sealed = k.encrypt(&original).unwrap();

        let slices: Vec<&[u8]> = sealed.ciphertext.chunks(1024).collect();
        let total = slices.len() as u32;
        for (i, slice) in slices.iter().enumerate().rev() {
            let params = if i == 0 { Some(sealed.params) } else { None };
            store.flush(&chunk(i as u32, total, slice, params)).await.unwrap();
        }

        assert!(!store.is_encrypted_each(UID).await);
        let whole = store.reassemble(UID).await.unwrap();
        assert_eq!(whole.total, 1);
        let params = whole.params.unwrap();
        assert_eq!(k.decrypt_with(&whole.content, &params).unwrap(), original);
    }

    #[tokio::test]
    async fn test_reassemble_requires_finished() {
        let (_dir, store) = open().await;
        store.flush(&chunk(0, 3, b"x", None)).await.unwrap();
        assert!(matches!(
            store.reassemble(UID).await,
            Err(StoreError::NotFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_filled_by_later_chunk() {
        let (_dir, store) = open().await;
        store.flush(&chunk(1, 2, b"tail", None)).await.unwrap();
        assert!(store.record(UID).await.unwrap().name.is_none());

        let mut first = chunk(0, 2, b"head", None);
        first.name = Some(key().encrypt(b"movie.mkv").unwrap());
        first.archived = true;
        store.flush(&first).await.unwrap();

        let record = store.record(UID).await.unwrap();
        assert!(record.name.is_some());
        assert!(record.archived);
    }

    #[tokio::test]
    async fn test_remove_completely_leaves_nothing() {
        let (_dir, store) = open().await;
        store.flush(&chunk(0, 4, b"a", None)).await.unwrap();
        store.flush(&chunk(2, 4, b"c", None)).await.unwrap();
        assert!(store.has_catalog(UID).await);

        assert!(store.remove_completely(UID).await);
        assert!(!store.has_catalog(UID).await);
        assert!(store.record(UID).await.is_none());
        assert!(residue(&store).is_empty());
        assert!(!store.remove_completely(UID).await);
    }

    #[tokio::test]
    async fn test_partial_transfer_survives_until_cleanup() {
        let (dir, store) = open().await;
        store.flush(&chunk(0, 4, b"a", None)).await.unwrap();
        store.flush(&chunk(1, 4, b"b", None)).await.unwrap();

        // The receiving side went away; a reopened store still sees the partial state
        drop(store);
        let store = TransferStore::open(dir.path().join("store")).await.unwrap();
        assert!(!store.is_finished(UID).await);
        assert_eq!(store.stored_count(UID).await, 2);

        assert!(store.remove_completely(UID).await);
        assert!(residue(&store).is_empty());
    }

    #[tokio::test]
    async fn test_remove_last_chunk_removes_transfer() {
        let (_dir, store) = open().await;
        store.flush(&chunk(0, 2, b"a", None)).await.unwrap();
        store.flush(&chunk(1, 2, b"b", None)).await.unwrap();

        assert!(store.remove_chunk(UID, 0).await);
        assert!(store.has_catalog(UID).await);
        assert!(store.read_chunk(UID, 0).await.unwrap().is_none());

        assert!(store.remove_chunk(UID, 1).await);
        assert!(!store.has_catalog(UID).await);
        assert!(residue(&store).is_empty());
    }

    #[tokio::test]
    async fn test_remove_whole_is_full_removal() {
        let (_dir, store) = open().await;
        store.flush(&chunk(0, 1, b"whole", None)).await.unwrap();
        assert!(store.remove_chunk(UID, 0).await);
        assert!(!store.has_catalog(UID).await);
        assert!(residue(&store).is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_ids_and_indices() {
        let (_dir, store) = open().await;
        let mut unit = chunk(0, 1, b"x", None);
        unit.file_id = "../escape".to_string();
        assert!(matches!(store.flush(&unit).await, Err(StoreError::InvalidId(_))));

        assert!(matches!(
            store.flush(&chunk(5, 3, b"x", None)).await,
            Err(StoreError::OutOfRange { .. })
        ));
        assert!(store.all_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let (_dir, store) = open().await;
        store.flush(&chunk(0, 1, b"x", None)).await.unwrap();
        assert_eq!(store.prune_older_than(Duration::from_secs(3600)).await, 0);
        assert_eq!(store.prune_older_than(Duration::ZERO).await, 1);
        assert!(store.all_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_flushes_same_uid() {
        let (_dir, store) = open().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..16u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let content = vec![i as u8; 64];
                store.flush(&chunk(i, 16, &content, None)).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(store.is_finished(UID).await);
        assert_eq!(store.stored_count(UID).await, 16);
        assert_eq!(store.all_ids().await, vec![UID.to_string()]);
    }
}
