use serde::{Deserialize, Serialize};

/// Maximum size of a single chunk (512 KiB).
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Default number of chunk digests sent per `hash_batch`.
pub const DEFAULT_HASH_BATCH: usize = 16;

/// Upper bound on digests in one `hash_batch`.
pub const MAX_HASH_BATCH: usize = 1024;

/// Maximum encoded line length (1 MiB).
///
/// A full chunk is base64-encoded inside `chunk_data`, which inflates it by
/// a third; 1 MiB leaves room for that plus the envelope.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Maximum job identifier length accepted in `stream_open`.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Error code: malformed or out-of-sequence message.
pub const ERR_PROTOCOL: i32 = 400;

/// Error code: receiver-side storage or index failure.
pub const ERR_STORAGE: i32 = 500;

/// Error code: receiver is shutting down.
pub const ERR_UNAVAILABLE: i32 = 503;

/// Stream message type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Stream lifecycle
    StreamOpen,
    StreamOpenAck,
    StreamClose,

    // File-level negotiation
    FileDescriptor,
    SendFile,
    SkipFile,
    FileAbort,
    FileAbortAck,

    // Chunk-batch negotiation
    HashBatch,
    NeededDigests,
    SkipBatch,

    // Chunk payloads
    ChunkData,
    ChunkAck,
    ChunkError,

    // Whole-file verification
    FileChecksum,
    FileOk,
    FileChecksumError,

    // Protocol-level failure reply
    Error,
}

impl MessageType {
    /// Returns `true` for messages only the sending (client) side may originate.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::StreamOpen
                | Self::StreamClose
                | Self::FileDescriptor
                | Self::FileAbort
                | Self::HashBatch
                | Self::ChunkData
                | Self::FileChecksum
        )
    }
}
