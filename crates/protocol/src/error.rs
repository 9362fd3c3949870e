//! Error types for the wire protocol.

use crate::constants::MessageType;

/// Errors produced while encoding, decoding or validating messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },

    #[error("connection closed mid-message")]
    UnexpectedEof,

    #[error("missing payload for {0:?}")]
    MissingPayload(MessageType),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid stream open: {0}")]
    InvalidStreamOpen(String),
}
