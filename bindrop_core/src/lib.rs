//! Core of bindrop: end-to-end encrypted file relay.
//!
//! Two clients connect to a relay, get short codes, agree on a key through
//! the relay and then move AES-encrypted files through it. The relay only
//! ever sees ciphertext.

pub mod archive;
pub mod client;
pub mod codes;
pub mod config;
pub mod crypto;
pub mod error;
pub mod flow;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod transport;
pub mod utils;
pub mod worker;

pub use client::{Client, ClientEvent, ClientHandle, DownloadDirSink, FileSink};
pub use config::{ClientConfig, RelayConfig};
pub use crypto::{CipherParams, EncryptedPayload, SharedKey};
pub use error::{ClientError, CryptoError, ProtocolError, StoreError, TransportError};
pub use handshake::{HandshakeAction, HandshakeState, HandshakeTable};
pub use protocol::Message;
pub use relay::{Relay, RelayHandle, RelayState};
pub use store::{FileUnit, TransferRecord, TransferStore};
