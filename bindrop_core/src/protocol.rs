//! Wire messages exchanged between clients and the relay.
//!
//! Frame layout:
//!
//! ```text
//! | len: u32 BE | version: u8 | kind: u8 | bincode body (len - 2 bytes) |
//! ```
//!
//! Unknown kinds decode to [`Message::Unknown`] so the session can log
//! and drop them instead of tearing down.

use crate::crypto::EncryptedPayload;
use crate::error::{ProtocolError, TransportError};
use crate::store::FileUnit;
use bincode::Options;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted frame body (version + kind + payload)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyReply {
    pub code: String,
    pub allowed: bool,
    pub target_length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInvalidated {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCheck {
    pub code: String,
}

/// `code` echoes the candidate that was checked so replies can be matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeCheckReply {
    pub code: String,
    pub valid: bool,
    pub owner_id: String,
}

/// `sender_code` and `sender_id` are stamped by the relay; whatever the
/// client puts there is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRelay {
    pub target_id: String,
    pub sender_code: String,
    pub sender_id: String,
    pub public_key: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub target_code: String,
    pub sender_id: String,
    pub file_id: String,
    pub name: EncryptedPayload,
    pub size: EncryptedPayload,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAccept {
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReject {
    pub file_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Identify(Identify),
    IdentifyReply(IdentifyReply),
    CodeInvalidated(CodeInvalidated),
    CodeCheck(CodeCheck),
    CodeCheckReply(CodeCheckReply),
    HandshakeRelay(HandshakeRelay),
    TransferOffer(TransferOffer),
    TransferAccept(TransferAccept),
    TransferReject(TransferReject),
    TransferChunk(FileUnit),
    Disconnect,
    /// A kind this build does not know about
    Unknown { kind: u8 },
}

mod kind {
    pub const IDENTIFY: u8 = 1;
    pub const IDENTIFY_REPLY: u8 = 2;
    pub const CODE_INVALIDATED: u8 = 3;
    pub const CODE_CHECK: u8 = 4;
    pub const CODE_CHECK_REPLY: u8 = 5;
    pub const HANDSHAKE_RELAY: u8 = 6;
    pub const TRANSFER_OFFER: u8 = 7;
    pub const TRANSFER_ACCEPT: u8 = 8;
    pub const TRANSFER_REJECT: u8 = 9;
    pub const TRANSFER_CHUNK: u8 = 10;
    pub const DISCONNECT: u8 = 11;
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_FRAME_LEN as u64)
}

fn body<T: Serialize>(value: &T, name: &'static str) -> Result<Vec<u8>, ProtocolError> {
    codec()
        .serialize(value)
        .map_err(|e| ProtocolError::Malformed {
            kind: name,
            reason: e.to_string(),
        })
}

fn parse<T: DeserializeOwned>(bytes: &[u8], name: &'static str) -> Result<T, ProtocolError> {
    codec()
        .deserialize(bytes)
        .map_err(|e| ProtocolError::Malformed {
            kind: name,
            reason: e.to_string(),
        })
}

impl Message {
    pub fn kind(&self) -> u8 {
        match self {
            Message::Identify(_) => kind::IDENTIFY,
            Message::IdentifyReply(_) => kind::IDENTIFY_REPLY,
            Message::CodeInvalidated(_) => kind::CODE_INVALIDATED,
            Message::CodeCheck(_) => kind::CODE_CHECK,
            Message::CodeCheckReply(_) => kind::CODE_CHECK_REPLY,
            Message::HandshakeRelay(_) => kind::HANDSHAKE_RELAY,
            Message::TransferOffer(_) => kind::TRANSFER_OFFER,
            Message::TransferAccept(_) => kind::TRANSFER_ACCEPT,
            Message::TransferReject(_) => kind::TRANSFER_REJECT,
            Message::TransferChunk(_) => kind::TRANSFER_CHUNK,
            Message::Disconnect => kind::DISCONNECT,
            Message::Unknown { kind } => *kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Identify(_) => "Identify",
            Message::IdentifyReply(_) => "IdentifyReply",
            Message::CodeInvalidated(_) => "CodeInvalidated",
            Message::CodeCheck(_) => "CodeCheck",
            Message::CodeCheckReply(_) => "CodeCheckReply",
            Message::HandshakeRelay(_) => "HandshakeRelay",
            Message::TransferOffer(_) => "TransferOffer",
            Message::TransferAccept(_) => "TransferAccept",
            Message::TransferReject(_) => "TransferReject",
            Message::TransferChunk(_) => "TransferChunk",
            Message::Disconnect => "Disconnect",
            Message::Unknown { .. } => "Unknown",
        }
    }

    /// Encode into a frame body (version, kind, payload) without the length prefix
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.name();
        let payload = match self {
            Message::Identify(m) => body(m, name)?,
            Message::IdentifyReply(m) => body(m, name)?,
            Message::CodeInvalidated(m) => body(m, name)?,
            Message::CodeCheck(m) => body(m, name)?,
            Message::CodeCheckReply(m) => body(m, name)?,
            Message::HandshakeRelay(m) => body(m, name)?,
            Message::TransferOffer(m) => body(m, name)?,
            Message::TransferAccept(m) => body(m, name)?,
            Message::TransferReject(m) => body(m, name)?,
            Message::TransferChunk(m) => body(m, name)?,
            Message::Disconnect => Vec::new(),
            Message::Unknown { .. } => {
                return Err(ProtocolError::Malformed {
                    kind: name,
                    reason: "unknown messages cannot be sent".to_string(),
                });
            }
        };

        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.push(PROTOCOL_VERSION);
        frame.push(self.kind());
        frame.extend_from_slice(&payload);
        if frame.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(frame.len()));
        }
        Ok(frame)
    }

    /// Decode a frame body produced by [`Message::encode`]
    pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
        let (&version, rest) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::Version(version));
        }
        let (&kind, payload) = rest.split_first().ok_or(ProtocolError::EmptyFrame)?;

        let msg = match kind {
            kind::IDENTIFY => Message::Identify(parse(payload, "Identify")?),
            kind::IDENTIFY_REPLY => Message::IdentifyReply(parse(payload, "IdentifyReply")?),
            kind::CODE_INVALIDATED => {
                Message::CodeInvalidated(parse(payload, "CodeInvalidated")?)
            }
            kind::CODE_CHECK => Message::CodeCheck(parse(payload, "CodeCheck")?),
            kind::CODE_CHECK_REPLY => Message::CodeCheckReply(parse(payload, "CodeCheckReply")?),
            kind::HANDSHAKE_RELAY => Message::HandshakeRelay(parse(payload, "HandshakeRelay")?),
            kind::TRANSFER_OFFER => Message::TransferOffer(parse(payload, "TransferOffer")?),
            kind::TRANSFER_ACCEPT => Message::TransferAccept(parse(payload, "TransferAccept")?),
            kind::TRANSFER_REJECT => Message::TransferReject(parse(payload, "TransferReject")?),
            kind::TRANSFER_CHUNK => Message::TransferChunk(parse(payload, "TransferChunk")?),
            kind::DISCONNECT => Message::Disconnect,
            other => Message::Unknown { kind: other },
        };
        Ok(msg)
    }
}

/// What came off the wire: a message, or a frame that had to be dropped
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    Invalid(ProtocolError),
}

/// Send a protocol message as one length-prefixed frame
pub async fn send_msg<W>(send: &mut W, msg: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = msg.encode().map_err(|e| TransportError::Stream(e.to_string()))?;
    let len = (frame.len() as u32).to_be_bytes();
    send.write_all(&len)
        .await
        .map_err(|e| TransportError::Stream(e.to_string()))?;
    send.write_all(&frame)
        .await
        .map_err(|e| TransportError::Stream(e.to_string()))?;
    Ok(())
}

/// Receive one frame. Transport failures end the session, protocol
/// failures come back as [`Inbound::Invalid`] with the frame consumed.
pub async fn recv_msg<R>(recv: &mut R) -> Result<Inbound, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match recv.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::Closed);
        }
        Err(e) => return Err(TransportError::Stream(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_LEN {
        let mut limited = (&mut *recv).take(len as u64);
        tokio::io::copy(&mut limited, &mut tokio::io::sink())
            .await
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        return Ok(Inbound::Invalid(ProtocolError::FrameTooLarge(len)));
    }

    let mut buf = vec![0u8; len];
    recv.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::Closed
        } else {
            TransportError::Stream(e.to_string())
        }
    })?;

    Ok(match Message::decode(&buf) {
        Ok(msg) => Inbound::Message(msg),
        Err(e) => Inbound::Invalid(e),
    })
}
