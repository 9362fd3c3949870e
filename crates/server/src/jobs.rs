use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chunkvault_session::ReceiverSummary;
use serde::Serialize;

/// Totals for one backup job, summed over its streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub streams_completed: u32,
    pub streams_failed: u32,
    pub files_committed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub files_aborted: u64,
    pub chunks_received: u64,
    pub chunks_deduplicated: u64,
    pub bytes_received: u64,
}

impl JobStats {
    fn add(&mut self, summary: &ReceiverSummary, completed: bool) {
        if completed {
            self.streams_completed += 1;
        } else {
            self.streams_failed += 1;
        }
        self.files_committed += summary.files_committed;
        self.files_skipped += summary.files_skipped;
        self.files_failed += summary.files_failed;
        self.files_aborted += summary.files_aborted;
        self.chunks_received += summary.chunks_received;
        self.chunks_deduplicated += summary.chunks_deduplicated;
        self.bytes_received += summary.bytes_received;
    }
}

/// Per-job statistics shared by all connection tasks.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobStats>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a finished stream into its job. Streams that never opened have
    /// no job and are ignored.
    pub fn record(&self, summary: &ReceiverSummary, completed: bool) {
        let Some(job_id) = &summary.job_id else {
            return;
        };
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.entry(job_id.clone())
            .or_default()
            .add(summary, completed);
    }

    pub fn get(&self, job_id: &str) -> Option<JobStats> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, JobStats> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
