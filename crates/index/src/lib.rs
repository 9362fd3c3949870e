//! Server-side chunk existence index.
//!
//! Metadata ([`ChunkRecord`], [`FileRecord`]) lives behind [`MetadataStore`];
//! chunk bytes live behind [`ChunkStore`]. [`ChunkIndex`] combines the two
//! and answers the file-level and chunk-level "do you already have it"
//! queries used during negotiation.

mod chunk_store;
mod error;
mod index;
mod journal;
mod metadata;
mod records;

pub use chunk_store::{ChunkStore, DirChunkStore, MemoryChunkStore, StoreFuture};
pub use error::IndexError;
pub use index::{ChunkIndex, IndexStats};
pub use journal::JournalStore;
pub use metadata::{MemoryStore, MetadataStore};
pub use records::{ChunkRecord, FileKey, FileRecord};
