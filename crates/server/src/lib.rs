//! Backup receiver server.
//!
//! Accepts any number of concurrent stream connections over TCP, runs one
//! [`Receiver`](chunkvault_session::Receiver) per connection against a
//! shared [`ChunkIndex`](chunkvault_index::ChunkIndex), and aggregates
//! per-job statistics across streams.

mod jobs;
mod server;

pub use jobs::{JobRegistry, JobStats};
pub use server::{BackupServer, ServerConfig};

/// Errors produced by the backup server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] chunkvault_index::IndexError),

    #[error("server already running")]
    AlreadyRunning,
}
