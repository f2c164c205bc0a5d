//! Short shareable codes and random identifiers.
//!
//! Codes are handed out by the relay and must be unique among the
//! sessions that are currently identified on that relay.

use rand::Rng;
use std::collections::HashSet;

/// Length of a relay-assigned code
pub const CODE_LENGTH: usize = 4;

/// Length of a file transfer identifier
pub const FILE_ID_LENGTH: usize = 24;

/// Length of a locally generated peer identifier
pub const PEER_ID_LENGTH: usize = 64;

const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Random token of `len` characters from `[0-9A-Za-z]`
pub fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn generate_file_id() -> String {
    random_token(FILE_ID_LENGTH)
}

pub fn generate_peer_id() -> String {
    random_token(PEER_ID_LENGTH)
}

/// Set of codes currently assigned by one relay instance.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    live: HashSet<String>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a code that no live session holds and reserve it
    pub fn assign(&mut self) -> String {
        loop {
            let code = random_token(CODE_LENGTH);
            if self.live.insert(code.clone()) {
                return code;
            }
        }
    }

    /// Free a code for reuse. Returns false if it was not assigned.
    pub fn release(&mut self, code: &str) -> bool {
        self.live.remove(code)
    }

    pub fn is_live(&self, code: &str) -> bool {
        self.live.contains(code)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
