//! AES-128-GCM content encryption keyed by a handshake secret.
//!
//! Every encryption draws a fresh random nonce. The nonce is the
//! `CipherParams` of that blob and has to travel with it; a blob whose
//! params are lost cannot be decrypted.

use crate::error::CryptoError;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// 96-bit GCM nonce
pub const NONCE_SIZE: usize = 12;

/// GCM authentication tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// AES key length taken from the front of the shared secret
pub const KEY_SIZE: usize = 16;

/// Per-operation parameters needed to decrypt one blob.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    pub nonce: [u8; NONCE_SIZE],
}

impl CipherParams {
    pub fn random() -> Self {
        Self {
            nonce: rand::random(),
        }
    }
}

impl std::fmt::Debug for CipherParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherParams(")?;
        for b in &self.nonce[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Ciphertext together with the params required to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: Bytes,
    pub params: CipherParams,
}

impl EncryptedPayload {
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

/// Symmetric key derived from a completed handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_SIZE]);

impl SharedKey {
    /// Build from raw agreement output; only the first 16 bytes are used
    pub fn from_secret(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() < KEY_SIZE {
            return Err(CryptoError::BadKeyLength(secret.len()));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&secret[..KEY_SIZE]);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> Result<Aes128Gcm, CryptoError> {
        Aes128Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::BadKeyLength(self.0.len()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let params = CipherParams::random();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&params.nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(EncryptedPayload {
            ciphertext: Bytes::from(ciphertext),
            params,
        })
    }

    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_with(&payload.ciphertext, &payload.params)
    }

    pub fn decrypt_with(
        &self,
        ciphertext: &[u8],
        params: &CipherParams,
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher()?
            .decrypt(Nonce::from_slice(&params.nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Convenience for short UTF-8 metadata such as names and sizes
    pub fn decrypt_string(&self, payload: &EncryptedPayload) -> Result<String, CryptoError> {
        let bytes = self.decrypt(payload)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}
