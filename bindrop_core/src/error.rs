use thiserror::Error;

/// Bind/connect/stream failures. Fatal to one session only.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {reason}")]
    Connect {
        addr: std::net::SocketAddr,
        reason: String,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(std::net::SocketAddr),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("stream closed")]
    Closed,

    #[error("stream error: {0}")]
    Stream(String),
}

/// Malformed or unexpected traffic. The message is dropped, the session lives on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0}")]
    Version(u8),

    #[error("frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("peer public key must be 32 bytes, got {0}")]
    BadKeyLength(usize),

    #[error("key agreement produced a non-contributory secret")]
    NonContributory,

    #[error("handshake with {0} is not complete")]
    NoSecret(String),

    #[error("cipher parameters missing")]
    MissingParams,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed")]
    Decrypt,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record for {uid}: {reason}")]
    Corrupt { uid: String, reason: String },

    #[error("unknown transfer {0}")]
    Unknown(String),

    #[error("invalid file id {0:?}")]
    InvalidId(String),

    #[error("chunk {index} out of range for {uid} (total {total})")]
    OutOfRange { uid: String, index: u32, total: u32 },

    #[error("transfer {0} is not finished")]
    NotFinished(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Refusals from the client-side API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no peer recorded for code {0}")]
    UnknownCode(String),

    #[error("handshake with code {0} is not complete")]
    HandshakeIncomplete(String),

    #[error("path does not exist: {0}")]
    MissingPath(std::path::PathBuf),

    #[error("not connected to the relay")]
    NotConnected,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
