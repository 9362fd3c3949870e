//! Stream coordinator for parallel backup.
//!
//! Partitions a job's files across streams, runs every stream as an
//! independent task, and collects their reports. A failing stream never
//! stops the others.

use std::sync::Arc;
use std::time::Duration;

use chunkvault_protocol::FileDescriptor;
use chunkvault_session::{
    Connection, SessionContext, SessionError, SessionPolicy, SourceProvider, StreamReport,
    run_stream,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connector::StreamConnector;
use crate::error::CoordinatorError;
use crate::partition::partition;
use crate::report::JobReport;

/// What to back up and how.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: String,
    pub source_host: String,
    /// Requested parallelism.
    pub streams: usize,
    pub policy: SessionPolicy,
    /// Per-stream deadline. Zero means none.
    pub session_timeout: Duration,
}

/// Progress notifications, delivered best-effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    StreamStarted {
        stream_id: u32,
        files: usize,
    },
    StreamFinished {
        stream_id: u32,
        success: bool,
        transferred: usize,
        skipped: usize,
        failed: usize,
    },
}

/// Runs backup jobs as parallel streams.
pub struct StreamCoordinator<C, S> {
    connector: Arc<C>,
    source: S,
    events_tx: mpsc::Sender<CoordinatorEvent>,
    events_rx: Option<mpsc::Receiver<CoordinatorEvent>>,
    cancel: CancellationToken,
}

impl<C, S> StreamCoordinator<C, S>
where
    C: StreamConnector,
    S: SourceProvider + Clone + 'static,
{
    pub fn new(connector: C, source: S) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            connector: Arc::new(connector),
            source,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<CoordinatorEvent>> {
        self.events_rx.take()
    }

    /// Cancelling this token aborts every running stream. Files in flight
    /// are not committed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Backs up `files` over `job.streams` concurrent streams.
    ///
    /// Sublists are contiguous and keep the input order; streams whose
    /// sublist is empty are not opened.
    pub async fn run(
        &self,
        job: &JobSpec,
        files: Vec<FileDescriptor>,
    ) -> Result<JobReport, CoordinatorError> {
        if job.streams == 0 {
            return Err(CoordinatorError::NoStreams);
        }
        if job.job_id.is_empty() {
            return Err(CoordinatorError::EmptyJobId);
        }

        let total = files.len();
        let mut tasks = JoinSet::new();
        for (index, part) in partition(files, job.streams).into_iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            let stream_id = index as u32;
            let ctx = SessionContext::new(job.job_id.clone(), stream_id, job.source_host.clone())
                .with_policy(job.policy.clone())
                .with_cancel(self.cancel.child_token())
                .with_timeout(job.session_timeout);

            tasks.spawn(run_one(
                Arc::clone(&self.connector),
                self.source.clone(),
                ctx,
                part,
                self.events_tx.clone(),
            ));
        }
        info!(
            job_id = %job.job_id,
            files = total,
            streams = tasks.len(),
            "job started"
        );

        let mut streams = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            streams.push(joined?);
        }
        streams.sort_by_key(|s| s.stream_id);

        let report = JobReport {
            job_id: job.job_id.clone(),
            streams,
        };
        info!(
            job_id = %report.job_id,
            success = report.is_success(),
            transferred = report.files_transferred(),
            skipped = report.files_skipped(),
            failed = report.files_failed(),
            bytes = report.bytes_sent(),
            "job finished"
        );
        Ok(report)
    }
}

async fn run_one<C, S>(
    connector: Arc<C>,
    source: S,
    ctx: SessionContext,
    files: Vec<FileDescriptor>,
    events: mpsc::Sender<CoordinatorEvent>,
) -> StreamReport
where
    C: StreamConnector,
    S: SourceProvider,
{
    let stream_id = ctx.stream_id;
    let _ = events.try_send(CoordinatorEvent::StreamStarted {
        stream_id,
        files: files.len(),
    });

    let connected = ctx
        .guard(async {
            connector
                .connect(stream_id)
                .await
                .map_err(SessionError::Connect)
        })
        .await;

    let report = match connected {
        Ok((reader, writer)) => {
            run_stream(Connection::new(reader, writer), ctx, source, &files).await
        }
        Err(e) => {
            warn!(stream_id, error = %e, "stream could not connect");
            let mut report = StreamReport::new(stream_id);
            report.error = Some(e);
            report
        }
    };

    let _ = events.try_send(CoordinatorEvent::StreamFinished {
        stream_id,
        success: report.is_success(),
        transferred: report.transferred(),
        skipped: report.skipped(),
        failed: report.failed(),
    });
    report
}
