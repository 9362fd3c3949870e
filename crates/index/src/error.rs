use chunkvault_protocol::Digest;

/// Errors produced by the index and its stores.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("journal corrupt at line {line}: {reason}")]
    CorruptJournal { line: usize, reason: String },

    #[error("chunk {0} is referenced but not stored")]
    MissingChunk(Digest),

    #[error("stored chunk {digest} is corrupt: {reason}")]
    CorruptChunk { digest: Digest, reason: String },

    #[error("invalid chunk location: {0}")]
    InvalidLocation(#[from] chunkvault_transfer::TransferError),
}
