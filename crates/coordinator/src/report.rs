use chunkvault_session::StreamReport;

/// Outcome of a whole job: one report per launched stream, ordered by
/// stream id.
#[derive(Debug, Default)]
pub struct JobReport {
    pub job_id: String,
    pub streams: Vec<StreamReport>,
}

impl JobReport {
    /// True only when every launched stream completed without a fatal
    /// error. Individual files may still have failed under
    /// [`FailurePolicy::AbortFile`](chunkvault_session::FailurePolicy).
    pub fn is_success(&self) -> bool {
        self.streams.iter().all(StreamReport::is_success)
    }

    pub fn failed_streams(&self) -> impl Iterator<Item = &StreamReport> {
        self.streams.iter().filter(|s| !s.is_success())
    }

    pub fn files_transferred(&self) -> usize {
        self.streams.iter().map(StreamReport::transferred).sum()
    }

    pub fn files_skipped(&self) -> usize {
        self.streams.iter().map(StreamReport::skipped).sum()
    }

    pub fn files_failed(&self) -> usize {
        self.streams.iter().map(StreamReport::failed).sum()
    }

    pub fn chunks_sent(&self) -> u64 {
        self.streams.iter().map(StreamReport::chunks_sent).sum()
    }

    pub fn chunks_deduplicated(&self) -> u64 {
        self.streams
            .iter()
            .map(StreamReport::chunks_deduplicated)
            .sum()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.streams.iter().map(StreamReport::bytes_sent).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_session::SessionError;

    #[test]
    fn one_failed_stream_fails_the_job() {
        let mut report = JobReport {
            job_id: "j".into(),
            streams: vec![StreamReport::new(0), StreamReport::new(1)],
        };
        assert!(report.is_success());

        report.streams[1].error = Some(SessionError::ConnectionClosed);
        assert!(!report.is_success());
        assert_eq!(report.failed_streams().count(), 1);
    }
}
