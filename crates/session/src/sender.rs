use chunkvault_protocol::messages::{
    ChunkAckResponse, ChunkDataRequest, ChunkErrorResponse, FileAbortRequest,
    FileChecksumErrorResponse, FileChecksumRequest, FileOkResponse, HashBatchRequest,
    NeededDigestsResponse, StreamOpenRequest,
};
use chunkvault_protocol::{FileDescriptor, Message, MessageType};
use chunkvault_transfer::{Chunk, ChunkSplitter};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::context::{FailurePolicy, SessionContext};
use crate::error::{ErrorClass, SessionError};
use crate::report::{FileOutcome, FileReport, StreamReport};
use crate::source::SourceProvider;

/// Why a file stopped before its checksum was sent.
enum FileFailure {
    /// The stream is still usable; the receiver is told with `file_abort`.
    Abort { reason: String, class: ErrorClass },
    Stream(SessionError),
}

impl From<SessionError> for FileFailure {
    fn from(e: SessionError) -> Self {
        Self::Stream(e)
    }
}

#[derive(Debug, Default)]
struct ChunkStats {
    chunks_sent: u64,
    chunks_deduplicated: u64,
    bytes_sent: u64,
}

/// Sending side of one stream.
pub struct Sender<R, W, S> {
    conn: Connection<R, W>,
    ctx: SessionContext,
    source: S,
    report: StreamReport,
}

impl<R, W, S> Sender<R, W, S>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: SourceProvider,
{
    /// Opens the stream and waits for the receiver to accept it.
    pub async fn open(
        conn: Connection<R, W>,
        ctx: SessionContext,
        source: S,
    ) -> Result<Self, SessionError> {
        let report = StreamReport::new(ctx.stream_id);
        let mut sender = Self {
            conn,
            ctx,
            source,
            report,
        };

        let open = StreamOpenRequest {
            job_id: sender.ctx.job_id.clone(),
            stream_id: sender.ctx.stream_id,
            source_host: sender.ctx.source_host.clone(),
            digest: sender.ctx.policy.digest,
        };
        let reply = sender.request(MessageType::StreamOpen, Some(&open)).await?;
        expect(&reply, MessageType::StreamOpenAck, "stream_open_ack")?;

        info!(
            job_id = %sender.ctx.job_id,
            stream_id = sender.ctx.stream_id,
            "stream open"
        );
        Ok(sender)
    }

    pub fn report(&self) -> &StreamReport {
        &self.report
    }

    pub fn into_report(self) -> StreamReport {
        self.report
    }

    /// Offers one file and, if the receiver wants it, transfers it.
    ///
    /// File-level failures come back as [`FileOutcome::Failed`] with the
    /// stream still usable. An `Err` means the stream itself is gone.
    pub async fn send_file(&mut self, file: &FileDescriptor) -> Result<FileOutcome, SessionError> {
        let reply = self.request(MessageType::FileDescriptor, Some(file)).await?;
        match reply.msg_type {
            MessageType::SkipFile => {
                debug!(path = %file.path, "receiver has this version");
                return Ok(FileOutcome::Skipped);
            }
            MessageType::SendFile => {}
            got => {
                return Err(SessionError::UnexpectedMessage {
                    expected: "send_file or skip_file",
                    got,
                });
            }
        }

        let reader = match self.source.open(file).await {
            Ok(reader) => reader,
            Err(e) => {
                return self
                    .abort_file(file, format!("open failed: {e}"), ErrorClass::Resource)
                    .await;
            }
        };
        let mut splitter =
            ChunkSplitter::new(reader, self.ctx.policy.chunk_size, self.ctx.policy.digest)?;

        let stats = match self.send_chunks(&mut splitter).await {
            Ok(stats) => stats,
            Err(FileFailure::Stream(e)) => return Err(e),
            Err(FileFailure::Abort { reason, class }) => {
                return self.abort_file(file, reason, class).await;
            }
        };

        let checksum = FileChecksumRequest {
            crc32: splitter.file_crc(),
            size: splitter.bytes_read(),
        };
        let reply = self
            .request(MessageType::FileChecksum, Some(&checksum))
            .await?;
        match reply.msg_type {
            MessageType::FileOk => {
                let ok: FileOkResponse = reply.require_payload()?;
                info!(
                    path = %file.path,
                    size = checksum.size,
                    chunks_sent = stats.chunks_sent,
                    chunks_deduplicated = stats.chunks_deduplicated,
                    "file transferred"
                );
                Ok(FileOutcome::Transferred {
                    chunks_sent: stats.chunks_sent,
                    chunks_deduplicated: stats.chunks_deduplicated,
                    bytes_sent: stats.bytes_sent,
                    file_digest: ok.file_digest,
                })
            }
            MessageType::FileChecksumError => {
                let body: FileChecksumErrorResponse = reply.require_payload()?;
                warn!(
                    path = %file.path,
                    expected = format_args!("{:08x}", body.expected),
                    actual = ?body.actual,
                    reason = %body.reason,
                    "file rejected by receiver"
                );
                Ok(FileOutcome::Failed {
                    reason: body.reason,
                    class: ErrorClass::Integrity,
                })
            }
            got => Err(SessionError::UnexpectedMessage {
                expected: "file_ok or file_checksum_error",
                got,
            }),
        }
    }

    /// Ends the stream politely.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let reply = self.request::<()>(MessageType::StreamClose, None).await?;
        expect(&reply, MessageType::StreamClose, "stream_close")?;
        info!(
            job_id = %self.ctx.job_id,
            stream_id = self.ctx.stream_id,
            transferred = self.report.transferred(),
            skipped = self.report.skipped(),
            failed = self.report.failed(),
            "stream closed"
        );
        Ok(())
    }

    /// Hash batches with one chunk of lookahead, so the final batch can be
    /// marked `last`.
    async fn send_chunks(
        &mut self,
        splitter: &mut ChunkSplitter<S::Reader>,
    ) -> Result<ChunkStats, FileFailure> {
        let mut stats = ChunkStats::default();
        let batch_size = self.ctx.policy.hash_batch_size.max(1);
        let mut lookahead = read_chunk(splitter).await?;

        loop {
            let mut batch = Vec::with_capacity(batch_size);
            while batch.len() < batch_size {
                let Some(chunk) = lookahead.take() else {
                    break;
                };
                batch.push(chunk);
                lookahead = read_chunk(splitter).await?;
            }
            let last = lookahead.is_none();

            self.send_batch(&batch, last, &mut stats).await?;
            if last {
                return Ok(stats);
            }
        }
    }

    async fn send_batch(
        &mut self,
        batch: &[Chunk],
        last: bool,
        stats: &mut ChunkStats,
    ) -> Result<(), FileFailure> {
        let request = HashBatchRequest {
            digests: batch.iter().map(|c| c.digest).collect(),
            last,
        };
        let reply = self.request(MessageType::HashBatch, Some(&request)).await?;
        let needed = match reply.msg_type {
            MessageType::SkipBatch => Vec::new(),
            MessageType::NeededDigests => {
                let body: NeededDigestsResponse =
                    reply.require_payload().map_err(SessionError::from)?;
                body.digests
            }
            got => {
                return Err(SessionError::UnexpectedMessage {
                    expected: "needed_digests or skip_batch",
                    got,
                }
                .into());
            }
        };
        trace!(offered = batch.len(), needed = needed.len(), last, "hash batch answered");

        if needed.len() > batch.len() {
            return Err(SessionError::InvalidBatch(format!(
                "{} digests requested from a batch of {}",
                needed.len(),
                batch.len()
            ))
            .into());
        }
        stats.chunks_deduplicated += (batch.len() - needed.len()) as u64;

        for digest in needed {
            let chunk = batch
                .iter()
                .find(|c| c.digest == digest)
                .ok_or(SessionError::UnknownDigest(digest))?;
            self.send_chunk(chunk).await?;
            stats.chunks_sent += 1;
            stats.bytes_sent += chunk.len() as u64;
        }
        Ok(())
    }

    async fn send_chunk(&mut self, chunk: &Chunk) -> Result<(), FileFailure> {
        let attempts = self.ctx.policy.chunk_retries.saturating_add(1);
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            let request = ChunkDataRequest {
                digest: chunk.digest,
                data: chunk.data.clone(),
            };
            let reply = self.request(MessageType::ChunkData, Some(&request)).await?;
            match reply.msg_type {
                MessageType::ChunkAck => {
                    let ack: ChunkAckResponse =
                        reply.require_payload().map_err(SessionError::from)?;
                    if ack.digest != chunk.digest {
                        return Err(SessionError::UnknownDigest(ack.digest).into());
                    }
                    return Ok(());
                }
                MessageType::ChunkError => {
                    let body: ChunkErrorResponse =
                        reply.require_payload().map_err(SessionError::from)?;
                    warn!(
                        digest = %chunk.digest.short(),
                        index = chunk.index,
                        attempt,
                        reason = %body.reason,
                        "chunk rejected"
                    );
                    if attempt < attempts {
                        self.report.chunk_retries += 1;
                    }
                    last_reason = body.reason;
                }
                got => {
                    return Err(SessionError::UnexpectedMessage {
                        expected: "chunk_ack or chunk_error",
                        got,
                    }
                    .into());
                }
            }
        }

        Err(FileFailure::Abort {
            reason: format!(
                "chunk {} at offset {} rejected {attempts} times: {last_reason}",
                chunk.digest.short(),
                chunk.offset
            ),
            class: ErrorClass::Integrity,
        })
    }

    async fn abort_file(
        &mut self,
        file: &FileDescriptor,
        reason: String,
        class: ErrorClass,
    ) -> Result<FileOutcome, SessionError> {
        warn!(path = %file.path, %reason, "aborting file");
        let request = FileAbortRequest {
            reason: reason.clone(),
        };
        let reply = self.request(MessageType::FileAbort, Some(&request)).await?;
        expect(&reply, MessageType::FileAbortAck, "file_abort_ack")?;
        Ok(FileOutcome::Failed { reason, class })
    }

    async fn request<T: Serialize>(
        &mut self,
        msg_type: MessageType,
        payload: Option<&T>,
    ) -> Result<Message, SessionError> {
        self.ctx.guard(self.conn.request(msg_type, payload)).await
    }
}

async fn read_chunk<Rd: AsyncRead + Unpin>(
    splitter: &mut ChunkSplitter<Rd>,
) -> Result<Option<Chunk>, FileFailure> {
    splitter
        .next_chunk()
        .await
        .map_err(|e| FileFailure::Abort {
            reason: e.to_string(),
            class: ErrorClass::Resource,
        })
}

fn expect(reply: &Message, want: MessageType, name: &'static str) -> Result<(), SessionError> {
    if reply.msg_type == want {
        Ok(())
    } else {
        Err(SessionError::UnexpectedMessage {
            expected: name,
            got: reply.msg_type,
        })
    }
}

/// Sends `files` over one stream in order and reports what happened to each.
///
/// Never panics or returns early with an error: a stream-level failure is
/// recorded in [`StreamReport::error`] alongside the files finished before it.
pub async fn run_stream<R, W, S>(
    conn: Connection<R, W>,
    ctx: SessionContext,
    source: S,
    files: &[FileDescriptor],
) -> StreamReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: SourceProvider,
{
    let stream_id = ctx.stream_id;
    let on_file_error = ctx.policy.on_file_error;

    let mut sender = match Sender::open(conn, ctx, source).await {
        Ok(sender) => sender,
        Err(e) => {
            warn!(stream_id, error = %e, "stream open failed");
            let mut report = StreamReport::new(stream_id);
            report.error = Some(e);
            return report;
        }
    };

    for file in files {
        match sender.send_file(file).await {
            Ok(outcome) => {
                let failure = match &outcome {
                    FileOutcome::Failed { reason, class } => Some((reason.clone(), *class)),
                    _ => None,
                };
                sender.report.files.push(FileReport {
                    path: file.path.clone(),
                    outcome,
                });
                if let Some((reason, class)) = failure
                    && on_file_error == FailurePolicy::AbortStream
                {
                    warn!(stream_id, path = %file.path, "stopping stream after failed file");
                    sender.report.error = Some(SessionError::FileFailed {
                        path: file.path.clone(),
                        reason,
                        class,
                    });
                    break;
                }
            }
            Err(e) => {
                warn!(stream_id, path = %file.path, error = %e, "stream failed");
                sender.report.error = Some(e);
                return sender.into_report();
            }
        }
    }

    if let Err(e) = sender.close().await {
        warn!(stream_id, error = %e, "stream close failed");
        sender.report.error.get_or_insert(e);
    }
    sender.into_report()
}
