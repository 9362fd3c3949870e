//! Coordinator error types.

/// Errors that stop a job before or while its streams run.
///
/// Failures inside a stream are not errors here: they are recorded in the
/// stream's report.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("stream count must be at least 1")]
    NoStreams,

    #[error("job id must not be empty")]
    EmptyJobId,

    #[error("stream task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
