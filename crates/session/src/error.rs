use chunkvault_index::IndexError;
use chunkvault_protocol::constants::{ERR_STORAGE, ERR_UNAVAILABLE};
use chunkvault_protocol::{Digest, MessageType, ProtocolError, WireError};
use chunkvault_transfer::{SourceReadError, TransferError};

/// Failure categories, used to decide what a failure takes down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or out-of-sequence message. Fatal to the connection.
    Protocol,
    /// Chunk or whole-file verification failed.
    Integrity,
    /// Source unreadable, store unwritable, index or network unavailable.
    Resource,
    /// Cancelled or past the session deadline.
    Cancelled,
}

/// Errors produced by a transfer session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("expected {expected}, got {got:?}")]
    UnexpectedMessage {
        expected: &'static str,
        got: MessageType,
    },

    #[error("reply seq {got} does not match request seq {expected}")]
    SeqMismatch { expected: u64, got: u64 },

    #[error("peer error {}: {}", .0.code, .0.message)]
    Remote(WireError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("digest {0} was not requested")]
    UnknownDigest(Digest),

    #[error("invalid hash batch: {0}")]
    InvalidBatch(String),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    SourceRead(#[from] SourceReadError),

    #[error("file {path} failed: {reason}")]
    FileFailed {
        path: String,
        reason: String,
        class: ErrorClass,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("session deadline exceeded")]
    DeadlineExceeded,
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Protocol(ProtocolError::Io(_)) => ErrorClass::Resource,
            Self::Remote(e) => match e.code {
                ERR_STORAGE => ErrorClass::Resource,
                ERR_UNAVAILABLE => ErrorClass::Cancelled,
                _ => ErrorClass::Protocol,
            },
            Self::Protocol(_)
            | Self::UnexpectedMessage { .. }
            | Self::SeqMismatch { .. }
            | Self::ConnectionClosed
            | Self::UnknownDigest(_)
            | Self::InvalidBatch(_) => ErrorClass::Protocol,
            Self::Index(_) | Self::Transfer(_) | Self::SourceRead(_) | Self::Connect(_) => {
                ErrorClass::Resource
            }
            Self::FileFailed { class, .. } => *class,
            Self::Cancelled | Self::DeadlineExceeded => ErrorClass::Cancelled,
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Json(e))
    }
}
