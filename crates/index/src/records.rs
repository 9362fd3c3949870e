use chrono::{DateTime, Utc};
use chunkvault_protocol::{Digest, DigestAlgorithm};
use serde::{Deserialize, Serialize};

/// Durable fact about one stored chunk. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub digest: Digest,
    /// Store-relative location of the bytes.
    pub location: String,
    pub length: u64,
    pub crc32: u32,
}

/// One committed version of a file.
///
/// Versions are appended, never overwritten; `backup_time` orders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub source_host: String,
    pub mod_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
    pub size: u64,
    pub mode: u32,
    pub owner: u32,
    pub group: u32,
    /// Whole-file CRC32.
    pub crc32: u32,
    /// Chunk digests in file order.
    pub chunks: Vec<Digest>,
    /// Digest over `chunks`.
    pub file_digest: Digest,
    pub digest_algorithm: DigestAlgorithm,
    pub job_id: String,
    pub backup_time: DateTime<Utc>,
}

impl FileRecord {
    pub fn key(&self) -> FileKey {
        FileKey {
            path: self.path.clone(),
            source_host: self.source_host.clone(),
            mod_time: self.mod_time,
        }
    }
}

/// Identity used by the file-level skip decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub path: String,
    pub source_host: String,
    pub mod_time: DateTime<Utc>,
}
