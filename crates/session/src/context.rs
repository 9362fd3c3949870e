use std::future::Future;
use std::time::Duration;

use chunkvault_protocol::DigestAlgorithm;
use chunkvault_protocol::constants::{DEFAULT_HASH_BATCH, MAX_CHUNK_SIZE};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

/// What a file-level failure takes down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record the failure and continue with the next file.
    #[default]
    AbortFile,
    /// Stop the whole stream after the first failed file.
    AbortStream,
}

/// Tunables for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPolicy {
    pub chunk_size: usize,
    /// Digests per `hash_batch`.
    pub hash_batch_size: usize,
    /// Resends after a chunk fails verification.
    pub chunk_retries: u32,
    pub on_file_error: FailurePolicy,
    pub digest: DigestAlgorithm,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            hash_batch_size: DEFAULT_HASH_BATCH,
            chunk_retries: 1,
            on_file_error: FailurePolicy::AbortFile,
            digest: DigestAlgorithm::Blake3,
        }
    }
}

/// Everything one side of a stream needs, passed explicitly.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub job_id: String,
    pub stream_id: u32,
    pub source_host: String,
    /// Whole-session deadline.
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub policy: SessionPolicy,
}

impl SessionContext {
    pub fn new(job_id: impl Into<String>, stream_id: u32, source_host: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            stream_id,
            source_host: source_host.into(),
            deadline: None,
            cancel: CancellationToken::new(),
            policy: SessionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the deadline `timeout` from now. A zero timeout means none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        self
    }

    /// Runs `fut` unless the session is cancelled or its deadline passes
    /// first.
    pub async fn guard<F, T, E>(&self, fut: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<SessionError>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            _ = deadline => Err(SessionError::DeadlineExceeded),
            result = fut => result.map_err(Into::into),
        }
    }
}
