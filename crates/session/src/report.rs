use chunkvault_protocol::Digest;

use crate::error::{ErrorClass, SessionError};

/// Result of offering one file on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Receiver already had this version.
    Skipped,
    /// Committed by the receiver.
    Transferred {
        chunks_sent: u64,
        chunks_deduplicated: u64,
        bytes_sent: u64,
        file_digest: Digest,
    },
    /// Not committed; the stream may continue depending on policy.
    Failed { reason: String, class: ErrorClass },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: String,
    pub outcome: FileOutcome,
}

/// Sender-side summary of one stream.
#[derive(Debug, Default)]
pub struct StreamReport {
    pub stream_id: u32,
    pub files: Vec<FileReport>,
    /// Chunk resends after a verification failure.
    pub chunk_retries: u64,
    /// Set when the stream ended early.
    pub error: Option<SessionError>,
}

impl StreamReport {
    pub fn new(stream_id: u32) -> Self {
        Self {
            stream_id,
            ..Self::default()
        }
    }

    /// True when the stream ran to completion. Individual files may still
    /// have failed.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn transferred(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Transferred { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed { .. }))
    }

    pub fn chunks_sent(&self) -> u64 {
        self.sum(|o| match o {
            FileOutcome::Transferred { chunks_sent, .. } => *chunks_sent,
            _ => 0,
        })
    }

    pub fn chunks_deduplicated(&self) -> u64 {
        self.sum(|o| match o {
            FileOutcome::Transferred {
                chunks_deduplicated,
                ..
            } => *chunks_deduplicated,
            _ => 0,
        })
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sum(|o| match o {
            FileOutcome::Transferred { bytes_sent, .. } => *bytes_sent,
            _ => 0,
        })
    }

    fn count(&self, pred: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| pred(&f.outcome)).count()
    }

    fn sum(&self, f: impl Fn(&FileOutcome) -> u64) -> u64 {
        self.files.iter().map(|r| f(&r.outcome)).sum()
    }
}
