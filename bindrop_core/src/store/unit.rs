use crate::crypto::{CipherParams, EncryptedPayload};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One piece of a transfer on the wire: either the whole file (`total == 1`)
/// or chunk `index` of a split series.
///
/// Only the first unit a sender produces carries the encrypted name and
/// size. `params` is `None` for follow-up slices of an encrypt-once series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUnit {
    pub file_id: String,
    /// Stamped by the relay, ignored when set by a client
    pub sender_id: String,
    pub target_code: String,
    pub name: Option<EncryptedPayload>,
    pub size: Option<EncryptedPayload>,
    pub archived: bool,
    pub index: u32,
    pub total: u32,
    pub final_chunk: bool,
    pub content: Bytes,
    pub params: Option<CipherParams>,
}

impl FileUnit {
    pub fn is_whole(&self) -> bool {
        self.total == 1
    }
}

/// Catalog entry persisted as `<uid>.json`.
///
/// `chunks` maps every stored index to the params it arrived with. Content
/// bytes are kept in separate blob files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub file_id: String,
    pub sender_id: String,
    pub target_code: String,
    pub name: Option<EncryptedPayload>,
    pub size: Option<EncryptedPayload>,
    pub archived: bool,
    pub total: u32,
    pub finished: bool,
    pub final_seen: bool,
    /// Unix seconds
    pub created_at: u64,
    pub chunks: BTreeMap<u32, Option<CipherParams>>,
}

impl TransferRecord {
    pub(crate) fn new(unit: &FileUnit, created_at: u64) -> Self {
        Self {
            file_id: unit.file_id.clone(),
            sender_id: unit.sender_id.clone(),
            target_code: unit.target_code.clone(),
            name: None,
            size: None,
            archived: false,
            total: unit.total,
            finished: false,
            final_seen: false,
            created_at,
            chunks: BTreeMap::new(),
        }
    }

    /// Fold one stored unit into the record and recompute `finished`.
    /// Once finished the flag never goes back.
    pub(crate) fn absorb(&mut self, unit: &FileUnit) {
        self.chunks.insert(unit.index, unit.params);
        if self.name.is_none() {
            self.name = unit.name.clone();
        }
        if self.size.is_none() {
            self.size = unit.size.clone();
        }
        if self.sender_id.is_empty() {
            self.sender_id = unit.sender_id.clone();
        }
        self.archived |= unit.archived;
        if unit.final_chunk || unit.total == 1 {
            self.final_seen = true;
        }
        if !self.finished {
            self.finished = self.final_seen && (0..self.total).all(|i| self.chunks.contains_key(&i));
        }
    }

    /// More than one chunk carries its own params
    pub fn is_encrypted_each(&self) -> bool {
        self.chunks.values().filter(|p| p.is_some()).count() > 1
    }

    pub fn stored_count(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32, total: u32, params: Option<CipherParams>) -> FileUnit {
        FileUnit {
            file_id: "id".to_string(),
            sender_id: "sender".to_string(),
            target_code: "AB12".to_string(),
            name: None,
            size: None,
            archived: false,
            index,
            total,
            final_chunk: index + 1 == total,
            content: Bytes::new(),
            params,
        }
    }

    #[test]
    fn test_finished_needs_every_index() {
        let mut record = TransferRecord::new(&chunk(2, 3, None), 0);
        record.absorb(&chunk(2, 3, None));
        assert!(record.final_seen);
        assert!(!record.finished);
        record.absorb(&chunk(0, 3, None));
        assert!(!record.finished);
        record.absorb(&chunk(1, 3, None));
        assert!(record.finished);
    }

    #[test]
    fn test_mode_detection() {
        let p = Some(CipherParams { nonce: [1; 12] });
        let mut once = TransferRecord::new(&chunk(0, 2, p), 0);
        once.absorb(&chunk(0, 2, p));
        once.absorb(&chunk(1, 2, None));
        assert!(!once.is_encrypted_each());

        let mut each = TransferRecord::new(&chunk(0, 2, p), 0);
        each.absorb(&chunk(0, 2, p));
        each.absorb(&chunk(1, 2, p));
        assert!(each.is_encrypted_each());
    }
}
