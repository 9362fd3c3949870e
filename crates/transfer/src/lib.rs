//! Source-side data pipeline: fixed-size chunking with per-chunk digests,
//! whole-file CRC32 accumulation, CRC32 combining and file traversal.

mod chunked;
mod combine;
mod digest;
mod scanner;
mod validation;

pub use chunked::{Chunk, ChunkSplitter, SourceReadError};
pub use combine::{CombineError, Crc32Combiner, combine_all, crc32_combine};
pub use digest::{chunk_crc32, chunk_digest, file_digest};
pub use scanner::{descriptor_for, scan_files};
pub use validation::validate_relative_path;

pub use chunkvault_protocol::constants::MAX_CHUNK_SIZE;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid chunk size {0} (must be 1..={MAX_CHUNK_SIZE})")]
    InvalidChunkSize(usize),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    SourceRead(#[from] SourceReadError),
}
