//! Payload types carried inside [`Message`](crate::Message) envelopes.
//!
//! Messages with no payload (`stream_open_ack`, `send_file`, `skip_file`,
//! `skip_batch`, `file_abort_ack`, `stream_close`) have no struct here.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_JOB_ID_LEN;
use crate::error::ProtocolError;
use crate::types::{Digest, DigestAlgorithm};

// ---------------------------------------------------------------------------
// Stream lifecycle
// ---------------------------------------------------------------------------

/// Opens a stream for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpenRequest {
    pub job_id: String,
    pub stream_id: u32,
    pub source_host: String,
    #[serde(default)]
    pub digest: DigestAlgorithm,
}

impl StreamOpenRequest {
    /// Rejects empty or malformed identifiers.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.job_id.is_empty() {
            return Err(ProtocolError::InvalidStreamOpen("empty job id".into()));
        }
        if self.job_id.len() > MAX_JOB_ID_LEN {
            return Err(ProtocolError::InvalidStreamOpen(format!(
                "job id longer than {MAX_JOB_ID_LEN} bytes"
            )));
        }
        if self
            .job_id
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
        {
            return Err(ProtocolError::InvalidStreamOpen(
                "job id contains whitespace or control characters".into(),
            ));
        }
        if self.source_host.trim().is_empty() {
            return Err(ProtocolError::InvalidStreamOpen("empty source host".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-level negotiation
// ---------------------------------------------------------------------------

/// Sender abandons the current file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAbortRequest {
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Chunk-batch negotiation
// ---------------------------------------------------------------------------

/// Ordered digests of the next batch of chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashBatchRequest {
    pub digests: Vec<Digest>,
    /// Set on the final batch of the file.
    pub last: bool,
}

/// Subset of a batch the receiver wants, in batch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeededDigestsResponse {
    pub digests: Vec<Digest>,
}

// ---------------------------------------------------------------------------
// Chunk payloads
// ---------------------------------------------------------------------------

/// Bytes of one chunk.
///
/// The `data` field is base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDataRequest {
    pub digest: Digest,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAckResponse {
    pub digest: Digest,
}

/// Chunk failed verification and was not stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkErrorResponse {
    pub digest: Digest,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Whole-file verification
// ---------------------------------------------------------------------------

/// CRC32 the sender accumulated over the whole file, and the bytes it read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChecksumRequest {
    pub crc32: u32,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOkResponse {
    pub file_digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChecksumErrorResponse {
    pub expected: u32,
    /// `None` when the checksum could not be reconstructed at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<u32>,
    pub reason: String,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
