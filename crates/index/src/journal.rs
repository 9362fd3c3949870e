//! Append-only JSON-lines metadata journal.
//!
//! Each line is one [`ChunkRecord`] or [`FileRecord`]. The journal is replayed
//! into memory on open; a torn final line (crash mid-append) is discarded and
//! truncated away, any other unparsable line is an error. A failed append is
//! rolled back to the last complete line before the store accepts another.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use chunkvault_protocol::Digest;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::IndexError;
use crate::metadata::{MetadataStore, Tables};
use crate::records::{ChunkRecord, FileRecord};

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Entry {
    Chunk(ChunkRecord),
    File(FileRecord),
}

struct Inner {
    tables: Tables,
    file: File,
    /// Length of the journal up to its last complete line.
    len: u64,
}

/// Durable [`MetadataStore`] backed by a JSON-lines journal.
pub struct JournalStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JournalStore {
    /// Opens (or creates) the journal at `path` and replays it.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tables = Tables::default();
        let mut good_len: u64 = 0;
        let mut torn = false;

        if path.exists() {
            let mut reader = BufReader::new(File::open(path)?);
            let mut line = String::new();
            let mut line_no = 0;
            loop {
                line.clear();
                let n = reader.read_line(&mut line)?;
                if n == 0 {
                    break;
                }
                line_no += 1;

                let complete = line.ends_with('\n');
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    good_len += n as u64;
                    continue;
                }

                // Appends are acknowledged only after the newline is written.
                if !complete {
                    warn!(path = %path.display(), line = line_no, "discarding torn journal tail");
                    torn = true;
                    break;
                }

                match serde_json::from_str::<Entry>(trimmed) {
                    Ok(entry) => {
                        apply(&mut tables, entry);
                        good_len += n as u64;
                    }
                    Err(e) => {
                        return Err(IndexError::CorruptJournal {
                            line: line_no,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if torn {
            file.set_len(good_len)?;
        }
        let len = file.metadata()?.len();

        info!(
            path = %path.display(),
            chunks = tables.chunk_count(),
            files = tables.file_count(),
            "metadata journal opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { tables, file, len }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply(tables: &mut Tables, entry: Entry) {
    match entry {
        Entry::Chunk(record) => {
            tables.insert_chunk(record);
        }
        Entry::File(record) => tables.insert_file(record),
    }
}

/// Appends one line, syncing it to disk when `durable` is set.
///
/// Bytes past `inner.len` belong to an append that failed partway and are cut
/// off first, so a torn write never ends up in the middle of the journal.
fn append(inner: &mut Inner, entry: &Entry, durable: bool) -> Result<(), IndexError> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let on_disk = inner.file.metadata()?.len();
    if on_disk != inner.len {
        warn!(on_disk, expected = inner.len, "truncating partial journal append");
        inner.file.set_len(inner.len)?;
    }

    let written = inner
        .file
        .write_all(&line)
        .and_then(|()| inner.file.flush())
        .and_then(|()| if durable { inner.file.sync_data() } else { Ok(()) });
    if let Err(e) = written {
        if let Err(rollback) = inner.file.set_len(inner.len) {
            warn!(error = %rollback, "journal rollback failed, retrying on next append");
        }
        return Err(e.into());
    }

    inner.len += line.len() as u64;
    Ok(())
}

impl MetadataStore for JournalStore {
    fn chunk(&self, digest: &Digest) -> Result<Option<ChunkRecord>, IndexError> {
        Ok(self.lock().tables.chunk(digest))
    }

    fn insert_chunk_if_absent(&self, record: ChunkRecord) -> Result<bool, IndexError> {
        let mut inner = self.lock();
        if inner.tables.contains_chunk(&record.digest) {
            return Ok(false);
        }
        let entry = Entry::Chunk(record);
        append(&mut inner, &entry, false)?;
        if let Entry::Chunk(record) = entry {
            inner.tables.insert_chunk(record);
        }
        Ok(true)
    }

    fn has_file_version(
        &self,
        path: &str,
        source_host: &str,
        mod_time: DateTime<Utc>,
    ) -> Result<bool, IndexError> {
        Ok(self.lock().tables.has_version(path, source_host, mod_time))
    }

    fn commit_file(&self, record: FileRecord) -> Result<(), IndexError> {
        let mut inner = self.lock();
        let entry = Entry::File(record);
        append(&mut inner, &entry, true)?;
        if let Entry::File(record) = entry {
            inner.tables.insert_file(record);
        }
        Ok(())
    }

    fn latest_file(&self, path: &str, source_host: &str) -> Result<Option<FileRecord>, IndexError> {
        Ok(self.lock().tables.latest(path, source_host))
    }

    fn file_history(&self, path: &str, source_host: &str) -> Result<Vec<FileRecord>, IndexError> {
        Ok(self.lock().tables.history(path, source_host))
    }

    fn latest_file_by_digest(
        &self,
        file_digest: &Digest,
    ) -> Result<Option<FileRecord>, IndexError> {
        Ok(self.lock().tables.by_digest(file_digest))
    }

    fn chunk_count(&self) -> usize {
        self.lock().tables.chunk_count()
    }

    fn file_count(&self) -> usize {
        self.lock().tables.file_count()
    }
}
