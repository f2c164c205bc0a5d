//! Per-peer Diffie-Hellman handshake.
//!
//! Roles are implicit: whoever creates the record first by calling
//! [`HandshakeTable::initiate`] is the initiator, a peer that first hears
//! about us through an incoming public key becomes the responder.
//!
//! ```text
//! initiator                      responder
//! ─────────                      ─────────
//! initiate()  ── pub_A ───────►  receive(pub_A)  => Complete, Reply(pub_B)
//! receive(pub_B) ◄── pub_B ────
//!   => Complete
//! ```

use crate::crypto::SharedKey;
use crate::error::CryptoError;
use std::collections::HashMap;
use x25519_dalek::{PublicKey, StaticSecret};

/// Encoded public key length
pub const PUBLIC_KEY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initiated,
    Complete,
    Failed,
}

/// Outcome of feeding a remote public key into the table
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeAction {
    /// We were the responder: the secret is derived and this key must be sent back
    Reply(Vec<u8>),
    /// We were the initiator and the secret is now derived
    Completed,
    /// The record was already complete; nothing changed
    Ignored,
    Failed(CryptoError),
}

struct Handshake {
    state: HandshakeState,
    local_secret: Option<StaticSecret>,
    local_public: [u8; PUBLIC_KEY_SIZE],
    key: Option<SharedKey>,
}

impl Handshake {
    fn generate() -> Self {
        let secret = StaticSecret::from(rand::random::<[u8; 32]>());
        let local_public = *PublicKey::from(&secret).as_bytes();
        Self {
            state: HandshakeState::Initiated,
            local_secret: Some(secret),
            local_public,
            key: None,
        }
    }

    /// Initiated -> Complete, exactly once. The private half is dropped afterwards.
    fn agree(&mut self, remote: &[u8]) -> Result<(), CryptoError> {
        let result = derive(self.local_secret.take(), remote);
        match result {
            Ok(key) => {
                self.key = Some(key);
                self.state = HandshakeState::Complete;
                Ok(())
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }
}

fn derive(secret: Option<StaticSecret>, remote: &[u8]) -> Result<SharedKey, CryptoError> {
    let secret = secret.ok_or(CryptoError::NonContributory)?;
    let remote: [u8; PUBLIC_KEY_SIZE] = remote
        .try_into()
        .map_err(|_| CryptoError::BadKeyLength(remote.len()))?;
    let shared = secret.diffie_hellman(&PublicKey::from(remote));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    SharedKey::from_secret(shared.as_bytes())
}

/// Handshake records keyed by remote peer identifier.
#[derive(Default)]
pub struct HandshakeTable {
    records: HashMap<String, Handshake>,
}

impl HandshakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a handshake with `peer_id` and return our public key to send.
    ///
    /// Returns `None` when a live record already exists. A `Failed` record is
    /// replaced by a fresh one.
    pub fn initiate(&mut self, peer_id: &str) -> Option<Vec<u8>> {
        if let Some(existing) = self.records.get(peer_id) {
            if existing.state != HandshakeState::Failed {
                return None;
            }
            tracing::debug!(peer = %peer_id, "Replacing failed handshake record");
        }
        let handshake = Handshake::generate();
        let public = handshake.local_public.to_vec();
        self.records.insert(peer_id.to_string(), handshake);
        Some(public)
    }

    /// Feed a public key received from `peer_id`.
    pub fn receive(&mut self, peer_id: &str, remote_key: &[u8]) -> HandshakeAction {
        match self.records.get_mut(peer_id) {
            Some(record) if record.state == HandshakeState::Complete => HandshakeAction::Ignored,
            Some(record) if record.state == HandshakeState::Initiated => {
                match record.agree(remote_key) {
                    Ok(()) => HandshakeAction::Completed,
                    Err(e) => HandshakeAction::Failed(e),
                }
            }
            // No record yet, or a failed one that cannot be resumed in place
            _ => {
                let mut record = Handshake::generate();
                let reply = record.local_public.to_vec();
                let outcome = record.agree(remote_key);
                self.records.insert(peer_id.to_string(), record);
                match outcome {
                    Ok(()) => HandshakeAction::Reply(reply),
                    Err(e) => HandshakeAction::Failed(e),
                }
            }
        }
    }

    pub fn state(&self, peer_id: &str) -> Option<HandshakeState> {
        self.records.get(peer_id).map(|r| r.state)
    }

    pub fn is_complete(&self, peer_id: &str) -> bool {
        self.state(peer_id) == Some(HandshakeState::Complete)
    }

    pub fn key(&self, peer_id: &str) -> Option<SharedKey> {
        self.records.get(peer_id).and_then(|r| r.key.clone())
    }

    /// Drop the record for a peer that went away
    pub fn forget(&mut self, peer_id: &str) -> bool {
        self.records.remove(peer_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
