use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chunkvault_protocol::Digest;
use chunkvault_transfer::{Crc32Combiner, chunk_crc32};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::chunk_store::{ChunkStore, DirChunkStore, MemoryChunkStore};
use crate::error::IndexError;
use crate::journal::JournalStore;
use crate::metadata::{MemoryStore, MetadataStore};
use crate::records::{ChunkRecord, FileRecord};

/// Counts reported by [`ChunkIndex::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub chunks: usize,
    pub file_versions: usize,
}

/// Server-side existence oracle over a metadata store and a chunk store.
///
/// Cheap to clone; all clones share the same stores, so concurrent sessions
/// deduplicate against each other.
#[derive(Clone)]
pub struct ChunkIndex {
    meta: Arc<dyn MetadataStore>,
    chunks: Arc<dyn ChunkStore>,
}

impl ChunkIndex {
    pub fn new(meta: Arc<dyn MetadataStore>, chunks: Arc<dyn ChunkStore>) -> Self {
        Self { meta, chunks }
    }

    /// Volatile index for tests.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryChunkStore::new()),
        )
    }

    /// Durable index rooted at `root`: `index.jsonl` plus a `chunks/` tree.
    pub fn open_dir(root: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(root)?;
        let meta = JournalStore::open(&root.join("index.jsonl"))?;
        let chunks = DirChunkStore::new(root.join("chunks"));
        Ok(Self::new(Arc::new(meta), Arc::new(chunks)))
    }

    /// False only when this exact (path, host, modification time) version is
    /// already committed.
    pub fn file_needed(
        &self,
        path: &str,
        source_host: &str,
        mod_time: DateTime<Utc>,
        change_time: DateTime<Utc>,
    ) -> Result<bool, IndexError> {
        let have = self.meta.has_file_version(path, source_host, mod_time)?;
        debug!(path, source_host, %mod_time, %change_time, have, "file lookup");
        Ok(!have)
    }

    /// Digests from `digests` with no ChunkRecord, in first-seen order,
    /// without repeats.
    pub fn chunks_needed(&self, digests: &[Digest]) -> Result<Vec<Digest>, IndexError> {
        let mut seen = HashSet::with_capacity(digests.len());
        let mut needed = Vec::new();
        for digest in digests {
            if !seen.insert(*digest) {
                continue;
            }
            if self.meta.chunk(digest)?.is_none() {
                needed.push(*digest);
            }
        }
        Ok(needed)
    }

    /// Stores verified chunk bytes and records them.
    ///
    /// A digest that is already recorded is a no-op returning the existing
    /// record.
    pub async fn store_chunk(&self, digest: Digest, data: &[u8]) -> Result<ChunkRecord, IndexError> {
        if let Some(existing) = self.meta.chunk(&digest)? {
            return Ok(existing);
        }

        let location = self.chunks.write_chunk(&digest, data).await?;
        let record = ChunkRecord {
            digest,
            location,
            length: data.len() as u64,
            crc32: chunk_crc32(data),
        };
        if self.meta.insert_chunk_if_absent(record.clone())? {
            Ok(record)
        } else {
            // Lost a race with another session; its record is authoritative.
            Ok(self.meta.chunk(&digest)?.unwrap_or(record))
        }
    }

    pub fn chunk_record(&self, digest: &Digest) -> Result<Option<ChunkRecord>, IndexError> {
        self.meta.chunk(digest)
    }

    /// Appends a file version. Every referenced chunk must already be stored.
    pub fn commit_file(&self, record: FileRecord) -> Result<(), IndexError> {
        for digest in &record.chunks {
            if self.meta.chunk(digest)?.is_none() {
                return Err(IndexError::MissingChunk(*digest));
            }
        }
        debug!(path = %record.path, chunks = record.chunks.len(), "file committed");
        self.meta.commit_file(record)
    }

    pub fn latest_file(
        &self,
        path: &str,
        source_host: &str,
    ) -> Result<Option<FileRecord>, IndexError> {
        self.meta.latest_file(path, source_host)
    }

    pub fn file_history(&self, path: &str, source_host: &str) -> Result<Vec<FileRecord>, IndexError> {
        self.meta.file_history(path, source_host)
    }

    pub fn file_exists_by_digest(&self, file_digest: &Digest) -> Result<bool, IndexError> {
        Ok(self.meta.latest_file_by_digest(file_digest)?.is_some())
    }

    pub fn latest_file_by_digest(
        &self,
        file_digest: &Digest,
    ) -> Result<Option<FileRecord>, IndexError> {
        self.meta.latest_file_by_digest(file_digest)
    }

    /// Writes a committed file's bytes to `out`, verifying every chunk's
    /// length and CRC32 and the whole-file CRC32. Returns bytes written.
    pub async fn restore_file<W: AsyncWrite + Unpin>(
        &self,
        record: &FileRecord,
        out: &mut W,
    ) -> Result<u64, IndexError> {
        let mut combiner = Crc32Combiner::new();
        for digest in &record.chunks {
            let chunk = self
                .meta
                .chunk(digest)?
                .ok_or(IndexError::MissingChunk(*digest))?;
            let data = self.chunks.read_chunk(&chunk.location).await?;

            if data.len() as u64 != chunk.length {
                return Err(IndexError::CorruptChunk {
                    digest: *digest,
                    reason: format!("length {} != recorded {}", data.len(), chunk.length),
                });
            }
            let crc = chunk_crc32(&data);
            if crc != chunk.crc32 {
                return Err(IndexError::CorruptChunk {
                    digest: *digest,
                    reason: format!("crc32 {crc:08x} != recorded {:08x}", chunk.crc32),
                });
            }

            out.write_all(&data).await?;
            combiner.push(crc, chunk.length);
        }
        out.flush().await?;

        if combiner.crc() != record.crc32 || combiner.len() != record.size {
            return Err(IndexError::CorruptChunk {
                digest: record.file_digest,
                reason: format!(
                    "reassembled file crc32 {:08x}/{} bytes != recorded {:08x}/{}",
                    combiner.crc(),
                    combiner.len(),
                    record.crc32,
                    record.size
                ),
            });
        }
        Ok(combiner.len())
    }

    /// Reassembles a committed file in memory.
    pub async fn read_file(&self, record: &FileRecord) -> Result<Vec<u8>, IndexError> {
        let mut buf = Vec::with_capacity(record.size as usize);
        self.restore_file(record, &mut buf).await?;
        Ok(buf)
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            chunks: self.meta.chunk_count(),
            file_versions: self.meta.file_count(),
        }
    }
}
