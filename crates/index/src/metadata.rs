use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use chunkvault_protocol::Digest;

use crate::error::IndexError;
use crate::records::{ChunkRecord, FileKey, FileRecord};

/// Durable ChunkRecord/FileRecord storage.
///
/// Every mutation is atomic per record: a reader never observes a partially
/// written record, and concurrent inserts of the same digest leave exactly
/// one ChunkRecord.
pub trait MetadataStore: Send + Sync + 'static {
    fn chunk(&self, digest: &Digest) -> Result<Option<ChunkRecord>, IndexError>;

    /// Inserts `record` unless its digest is already known.
    ///
    /// Returns `true` if this call inserted it.
    fn insert_chunk_if_absent(&self, record: ChunkRecord) -> Result<bool, IndexError>;

    /// Whether a version with exactly this (path, host, modification time)
    /// has been committed.
    fn has_file_version(
        &self,
        path: &str,
        source_host: &str,
        mod_time: DateTime<Utc>,
    ) -> Result<bool, IndexError>;

    /// Appends a file version to the history.
    fn commit_file(&self, record: FileRecord) -> Result<(), IndexError>;

    /// Most recent version by backup time.
    fn latest_file(&self, path: &str, source_host: &str) -> Result<Option<FileRecord>, IndexError>;

    /// All versions, oldest first.
    fn file_history(&self, path: &str, source_host: &str) -> Result<Vec<FileRecord>, IndexError>;

    /// Most recent version of any file whose content digest matches.
    fn latest_file_by_digest(&self, file_digest: &Digest)
    -> Result<Option<FileRecord>, IndexError>;

    fn chunk_count(&self) -> usize;

    fn file_count(&self) -> usize;
}

/// In-memory tables shared by [`MemoryStore`] and the journal replay.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    chunks: HashMap<Digest, ChunkRecord>,
    history: HashMap<(String, String), Vec<FileRecord>>,
    versions: HashSet<FileKey>,
    by_digest: HashMap<Digest, FileRecord>,
    file_count: usize,
}

impl Tables {
    pub(crate) fn chunk(&self, digest: &Digest) -> Option<ChunkRecord> {
        self.chunks.get(digest).cloned()
    }

    pub(crate) fn contains_chunk(&self, digest: &Digest) -> bool {
        self.chunks.contains_key(digest)
    }

    pub(crate) fn insert_chunk(&mut self, record: ChunkRecord) -> bool {
        if self.chunks.contains_key(&record.digest) {
            return false;
        }
        self.chunks.insert(record.digest, record);
        true
    }

    pub(crate) fn has_version(&self, path: &str, host: &str, mod_time: DateTime<Utc>) -> bool {
        self.versions.contains(&FileKey {
            path: path.to_owned(),
            source_host: host.to_owned(),
            mod_time,
        })
    }

    pub(crate) fn insert_file(&mut self, record: FileRecord) {
        self.versions.insert(record.key());

        let newer = self
            .by_digest
            .get(&record.file_digest)
            .is_none_or(|existing| existing.backup_time <= record.backup_time);
        if newer {
            self.by_digest.insert(record.file_digest, record.clone());
        }

        let versions = self
            .history
            .entry((record.path.clone(), record.source_host.clone()))
            .or_default();
        let pos = versions.partition_point(|v| v.backup_time <= record.backup_time);
        versions.insert(pos, record);
        self.file_count += 1;
    }

    pub(crate) fn history(&self, path: &str, host: &str) -> Vec<FileRecord> {
        self.history
            .get(&(path.to_owned(), host.to_owned()))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn latest(&self, path: &str, host: &str) -> Option<FileRecord> {
        self.history
            .get(&(path.to_owned(), host.to_owned()))
            .and_then(|v| v.last().cloned())
    }

    pub(crate) fn by_digest(&self, digest: &Digest) -> Option<FileRecord> {
        self.by_digest.get(digest).cloned()
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn file_count(&self) -> usize {
        self.file_count
    }
}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn chunk(&self, digest: &Digest) -> Result<Option<ChunkRecord>, IndexError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.chunk(digest))
    }

    fn insert_chunk_if_absent(&self, record: ChunkRecord) -> Result<bool, IndexError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.insert_chunk(record))
    }

    fn has_file_version(
        &self,
        path: &str,
        source_host: &str,
        mod_time: DateTime<Utc>,
    ) -> Result<bool, IndexError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.has_version(path, source_host, mod_time))
    }

    fn commit_file(&self, record: FileRecord) -> Result<(), IndexError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables.insert_file(record);
        Ok(())
    }

    fn latest_file(&self, path: &str, source_host: &str) -> Result<Option<FileRecord>, IndexError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.latest(path, source_host))
    }

    fn file_history(&self, path: &str, source_host: &str) -> Result<Vec<FileRecord>, IndexError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.history(path, source_host))
    }

    fn latest_file_by_digest(
        &self,
        file_digest: &Digest,
    ) -> Result<Option<FileRecord>, IndexError> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.by_digest(file_digest))
    }

    fn chunk_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .chunk_count()
    }

    fn file_count(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .file_count()
    }
}
