//! Receiving (server) side of a stream.
//!
//! ```text
//! AwaitingStreamStart --stream_open--> ReadyForFile
//! ReadyForFile --file_descriptor--> skip_file (ReadyForFile)
//!                                 | send_file  (AwaitingHashBatch)
//! AwaitingHashBatch --hash_batch--> skip_batch     (AwaitingHashBatch | AwaitingFileChecksum)
//!                                 | needed_digests (SendingChunks)
//! SendingChunks --chunk_data--> chunk_ack | chunk_error
//! AwaitingFileChecksum --file_checksum--> file_ok | file_checksum_error (ReadyForFile)
//! any file state --file_abort--> file_abort_ack (ReadyForFile)
//! ReadyForFile --stream_close--> stream_close (done)
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use chunkvault_index::{ChunkIndex, FileRecord};
use chunkvault_protocol::constants::{
    ERR_PROTOCOL, ERR_STORAGE, ERR_UNAVAILABLE, MAX_CHUNK_SIZE, MAX_HASH_BATCH,
};
use chunkvault_protocol::messages::{
    ChunkAckResponse, ChunkDataRequest, ChunkErrorResponse, FileAbortRequest,
    FileChecksumErrorResponse, FileChecksumRequest, FileOkResponse, HashBatchRequest,
    NeededDigestsResponse, StreamOpenRequest,
};
use chunkvault_protocol::{Digest, FileDescriptor, Message, MessageType, ProtocolError};
use chunkvault_transfer::{chunk_crc32, chunk_digest, combine_all, file_digest};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::context::SessionContext;
use crate::error::{ErrorClass, SessionError};

/// Counters for one receiving stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverSummary {
    pub connection_id: u32,
    /// Unset until a valid `stream_open` arrives.
    pub job_id: Option<String>,
    pub stream_id: Option<u32>,
    pub source_host: Option<String>,
    pub files_committed: u64,
    pub files_skipped: u64,
    /// Whole-file verification failed.
    pub files_failed: u64,
    /// Abandoned by the sender.
    pub files_aborted: u64,
    pub chunks_received: u64,
    /// Offered digests that were already stored.
    pub chunks_deduplicated: u64,
    pub chunks_rejected: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    AwaitingHashBatch,
    SendingChunks,
    AwaitingFileChecksum,
}

impl FileState {
    fn expects(self) -> &'static str {
        match self {
            Self::AwaitingHashBatch => "hash_batch",
            Self::SendingChunks => "chunk_data",
            Self::AwaitingFileChecksum => "file_checksum",
        }
    }
}

struct FileInProgress {
    descriptor: FileDescriptor,
    /// Every digest offered so far, in file order.
    order: Vec<Digest>,
    /// CRC32 and length of chunks received for this file.
    fresh: HashMap<Digest, (u32, u64)>,
    /// Requested from the current batch and not yet acknowledged.
    pending: VecDeque<Digest>,
    last_batch: bool,
}

enum Verdict {
    Match,
    Mismatch { actual: Option<u32>, reason: String },
}

/// Receiver state machine for one connection.
pub struct Receiver {
    index: ChunkIndex,
    ctx: SessionContext,
    summary: ReceiverSummary,
}

impl Receiver {
    /// `session_timeout` of zero means no deadline.
    pub fn new(
        index: ChunkIndex,
        connection_id: u32,
        cancel: CancellationToken,
        session_timeout: Duration,
    ) -> Self {
        let ctx = SessionContext::new(String::new(), 0, String::new())
            .with_cancel(cancel)
            .with_timeout(session_timeout);
        Self {
            index,
            ctx,
            summary: ReceiverSummary {
                connection_id,
                ..ReceiverSummary::default()
            },
        }
    }

    pub fn summary(&self) -> &ReceiverSummary {
        &self.summary
    }

    pub fn into_summary(self) -> ReceiverSummary {
        self.summary
    }

    /// Serves the stream until it is closed or fails.
    ///
    /// Nothing is committed for a file unless its whole-file checksum
    /// verified, whatever the reason the stream ends.
    pub async fn run<R, W>(&mut self, conn: &mut Connection<R, W>) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.serve(conn).await;
        match &result {
            Ok(()) => info!(
                connection_id = self.summary.connection_id,
                job_id = %self.ctx.job_id,
                stream_id = self.ctx.stream_id,
                committed = self.summary.files_committed,
                skipped = self.summary.files_skipped,
                chunks = self.summary.chunks_received,
                bytes = self.summary.bytes_received,
                "stream closed"
            ),
            Err(e) => {
                if e.class() == ErrorClass::Cancelled {
                    let _ = conn
                        .send(&Message::error(0, ERR_UNAVAILABLE, e.to_string()))
                        .await;
                }
                warn!(
                    connection_id = self.summary.connection_id,
                    job_id = %self.ctx.job_id,
                    stream_id = self.ctx.stream_id,
                    error = %e,
                    "stream failed"
                );
            }
        }
        result
    }

    async fn serve<R, W>(&mut self, conn: &mut Connection<R, W>) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let msg = self.next(conn).await?;
        if msg.msg_type != MessageType::StreamOpen {
            let err = SessionError::UnexpectedMessage {
                expected: "stream_open",
                got: msg.msg_type,
            };
            return Err(reject(conn, &msg, err).await);
        }
        let open = match parse_stream_open(&msg) {
            Ok(open) => open,
            Err(e) => return Err(reject(conn, &msg, e.into()).await),
        };

        self.ctx.job_id = open.job_id;
        self.ctx.stream_id = open.stream_id;
        self.ctx.source_host = open.source_host;
        self.ctx.policy.digest = open.digest;
        self.summary.job_id = Some(self.ctx.job_id.clone());
        self.summary.stream_id = Some(self.ctx.stream_id);
        self.summary.source_host = Some(self.ctx.source_host.clone());

        info!(
            connection_id = self.summary.connection_id,
            job_id = %self.ctx.job_id,
            stream_id = self.ctx.stream_id,
            source_host = %self.ctx.source_host,
            digest = self.ctx.policy.digest.as_str(),
            "stream opened"
        );
        conn.send(&msg.reply_bare(MessageType::StreamOpenAck)).await?;

        loop {
            let msg = self.next(conn).await?;
            match msg.msg_type {
                MessageType::StreamClose => {
                    conn.send(&msg.reply_bare(MessageType::StreamClose)).await?;
                    return Ok(());
                }
                MessageType::FileDescriptor => {
                    let descriptor: FileDescriptor = match msg.require_payload() {
                        Ok(d) => d,
                        Err(e) => return Err(reject(conn, &msg, e.into()).await),
                    };
                    let needed = match self.index.file_needed(
                        &descriptor.path,
                        &self.ctx.source_host,
                        descriptor.mod_time,
                        descriptor.change_time,
                    ) {
                        Ok(needed) => needed,
                        Err(e) => return Err(reject(conn, &msg, e.into()).await),
                    };

                    if !needed {
                        debug!(path = %descriptor.path, "file unchanged, skipping");
                        self.summary.files_skipped += 1;
                        conn.send(&msg.reply_bare(MessageType::SkipFile)).await?;
                        continue;
                    }

                    debug!(path = %descriptor.path, size = descriptor.size, "file needed");
                    conn.send(&msg.reply_bare(MessageType::SendFile)).await?;
                    self.receive_file(conn, descriptor).await?;
                }
                got => {
                    let err = SessionError::UnexpectedMessage {
                        expected: "file_descriptor or stream_close",
                        got,
                    };
                    return Err(reject(conn, &msg, err).await);
                }
            }
        }
    }

    async fn receive_file<R, W>(
        &mut self,
        conn: &mut Connection<R, W>,
        descriptor: FileDescriptor,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut file = FileInProgress {
            descriptor,
            order: Vec::new(),
            fresh: HashMap::new(),
            pending: VecDeque::new(),
            last_batch: false,
        };
        let mut state = FileState::AwaitingHashBatch;

        loop {
            let msg = self.next(conn).await?;
            state = match (state, msg.msg_type) {
                (_, MessageType::FileAbort) => {
                    let reason = msg
                        .parse_payload::<FileAbortRequest>()
                        .ok()
                        .flatten()
                        .map(|a| a.reason)
                        .unwrap_or_default();
                    warn!(path = %file.descriptor.path, %reason, "file aborted by sender");
                    self.summary.files_aborted += 1;
                    conn.send(&msg.reply_bare(MessageType::FileAbortAck)).await?;
                    return Ok(());
                }
                (FileState::AwaitingHashBatch, MessageType::HashBatch) => {
                    self.on_hash_batch(conn, &msg, &mut file).await?
                }
                (FileState::SendingChunks, MessageType::ChunkData) => {
                    self.on_chunk_data(conn, &msg, &mut file).await?
                }
                (FileState::AwaitingFileChecksum, MessageType::FileChecksum) => {
                    return self.on_file_checksum(conn, &msg, file).await;
                }
                (state, got) => {
                    let err = SessionError::UnexpectedMessage {
                        expected: state.expects(),
                        got,
                    };
                    return Err(reject(conn, &msg, err).await);
                }
            };
        }
    }

    async fn on_hash_batch<R, W>(
        &mut self,
        conn: &mut Connection<R, W>,
        msg: &Message,
        file: &mut FileInProgress,
    ) -> Result<FileState, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let batch: HashBatchRequest = match msg.require_payload() {
            Ok(b) => b,
            Err(e) => return Err(reject(conn, msg, e.into()).await),
        };
        if batch.digests.len() > MAX_HASH_BATCH {
            let err = SessionError::InvalidBatch(format!(
                "{} digests (max {MAX_HASH_BATCH})",
                batch.digests.len()
            ));
            return Err(reject(conn, msg, err).await);
        }
        if batch.digests.is_empty() && !batch.last {
            let err = SessionError::InvalidBatch("empty batch not marked last".into());
            return Err(reject(conn, msg, err).await);
        }

        let needed = match self.index.chunks_needed(&batch.digests) {
            Ok(needed) => needed,
            Err(e) => return Err(reject(conn, msg, e.into()).await),
        };
        trace!(
            path = %file.descriptor.path,
            offered = batch.digests.len(),
            needed = needed.len(),
            last = batch.last,
            "hash batch"
        );

        self.summary.chunks_deduplicated += (batch.digests.len() - needed.len()) as u64;
        file.order.extend_from_slice(&batch.digests);
        file.last_batch = batch.last;

        let after_batch = if batch.last {
            FileState::AwaitingFileChecksum
        } else {
            FileState::AwaitingHashBatch
        };

        if needed.is_empty() {
            conn.send(&msg.reply_bare(MessageType::SkipBatch)).await?;
            return Ok(after_batch);
        }

        let reply = msg.reply(
            MessageType::NeededDigests,
            Some(&NeededDigestsResponse {
                digests: needed.clone(),
            }),
        )?;
        conn.send(&reply).await?;
        file.pending = needed.into();
        Ok(FileState::SendingChunks)
    }

    async fn on_chunk_data<R, W>(
        &mut self,
        conn: &mut Connection<R, W>,
        msg: &Message,
        file: &mut FileInProgress,
    ) -> Result<FileState, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let chunk: ChunkDataRequest = match msg.require_payload() {
            Ok(c) => c,
            Err(e) => return Err(reject(conn, msg, e.into()).await),
        };
        if file.pending.front() != Some(&chunk.digest) {
            return Err(reject(conn, msg, SessionError::UnknownDigest(chunk.digest)).await);
        }

        let failure = if chunk.data.len() > MAX_CHUNK_SIZE {
            Some(format!("chunk of {} bytes exceeds maximum", chunk.data.len()))
        } else {
            let actual = chunk_digest(self.ctx.policy.digest, &chunk.data);
            (actual != chunk.digest).then(|| {
                format!(
                    "digest mismatch: received bytes hash to {}",
                    actual.short()
                )
            })
        };
        if let Some(reason) = failure {
            warn!(
                path = %file.descriptor.path,
                digest = %chunk.digest.short(),
                %reason,
                "chunk rejected"
            );
            self.summary.chunks_rejected += 1;
            let reply = msg.reply(
                MessageType::ChunkError,
                Some(&ChunkErrorResponse {
                    digest: chunk.digest,
                    reason,
                }),
            )?;
            conn.send(&reply).await?;
            return Ok(FileState::SendingChunks);
        }

        if let Err(e) = self.index.store_chunk(chunk.digest, &chunk.data).await {
            return Err(reject(conn, msg, e.into()).await);
        }

        let len = chunk.data.len() as u64;
        file.fresh
            .insert(chunk.digest, (chunk_crc32(&chunk.data), len));
        file.pending.pop_front();
        self.summary.chunks_received += 1;
        self.summary.bytes_received += len;
        trace!(digest = %chunk.digest.short(), len, "chunk stored");

        let reply = msg.reply(
            MessageType::ChunkAck,
            Some(&ChunkAckResponse {
                digest: chunk.digest,
            }),
        )?;
        conn.send(&reply).await?;

        Ok(if !file.pending.is_empty() {
            FileState::SendingChunks
        } else if file.last_batch {
            FileState::AwaitingFileChecksum
        } else {
            FileState::AwaitingHashBatch
        })
    }

    async fn on_file_checksum<R, W>(
        &mut self,
        conn: &mut Connection<R, W>,
        msg: &Message,
        file: FileInProgress,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let req: FileChecksumRequest = match msg.require_payload() {
            Ok(r) => r,
            Err(e) => return Err(reject(conn, msg, e.into()).await),
        };

        let verdict = match self.verify(&file, &req) {
            Ok(v) => v,
            Err(e) => return Err(reject(conn, msg, e).await),
        };

        match verdict {
            Verdict::Match => {
                let algorithm = self.ctx.policy.digest;
                let d = file.descriptor;
                let record = FileRecord {
                    path: d.path,
                    source_host: self.ctx.source_host.clone(),
                    mod_time: d.mod_time,
                    change_time: d.change_time,
                    size: req.size,
                    mode: d.mode,
                    owner: d.owner,
                    group: d.group,
                    crc32: req.crc32,
                    file_digest: file_digest(algorithm, &file.order),
                    chunks: file.order,
                    digest_algorithm: algorithm,
                    job_id: self.ctx.job_id.clone(),
                    backup_time: Utc::now(),
                };
                let file_digest = record.file_digest;
                let path = record.path.clone();

                if let Err(e) = self.index.commit_file(record) {
                    return Err(reject(conn, msg, e.into()).await);
                }
                self.summary.files_committed += 1;
                info!(
                    job_id = %self.ctx.job_id,
                    stream_id = self.ctx.stream_id,
                    %path,
                    size = req.size,
                    crc32 = format_args!("{:08x}", req.crc32),
                    "file committed"
                );

                let reply = msg.reply(MessageType::FileOk, Some(&FileOkResponse { file_digest }))?;
                conn.send(&reply).await?;
            }
            Verdict::Mismatch { actual, reason } => {
                self.summary.files_failed += 1;
                warn!(
                    job_id = %self.ctx.job_id,
                    path = %file.descriptor.path,
                    expected = format_args!("{:08x}", req.crc32),
                    actual = ?actual,
                    %reason,
                    "file failed verification"
                );
                let reply = msg.reply(
                    MessageType::FileChecksumError,
                    Some(&FileChecksumErrorResponse {
                        expected: req.crc32,
                        actual,
                        reason,
                    }),
                )?;
                conn.send(&reply).await?;
            }
        }
        Ok(())
    }

    /// Rebuilds the whole-file CRC32 from per-chunk CRC32s, taking chunks
    /// received during this file from memory and the rest from their records.
    fn verify(
        &self,
        file: &FileInProgress,
        req: &FileChecksumRequest,
    ) -> Result<Verdict, SessionError> {
        if req.size != file.descriptor.size {
            return Ok(Verdict::Mismatch {
                actual: None,
                reason: format!(
                    "size changed while reading: descriptor {} bytes, read {}",
                    file.descriptor.size, req.size
                ),
            });
        }

        let mut parts = Vec::with_capacity(file.order.len());
        for digest in &file.order {
            let part = match file.fresh.get(digest) {
                Some(&part) => part,
                None => match self.index.chunk_record(digest)? {
                    Some(record) => (record.crc32, record.length),
                    None => {
                        return Ok(Verdict::Mismatch {
                            actual: None,
                            reason: format!("chunk {} is not stored", digest.short()),
                        });
                    }
                },
            };
            parts.push(part);
        }

        Ok(match combine_all(parts, req.size) {
            Err(e) => Verdict::Mismatch {
                actual: None,
                reason: e.to_string(),
            },
            Ok(crc) if crc == req.crc32 => Verdict::Match,
            Ok(crc) => Verdict::Mismatch {
                actual: Some(crc),
                reason: "whole-file crc32 mismatch".into(),
            },
        })
    }

    async fn next<R, W>(&self, conn: &mut Connection<R, W>) -> Result<Message, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.ctx
            .guard(conn.recv())
            .await?
            .ok_or(SessionError::ConnectionClosed)
    }
}

fn parse_stream_open(msg: &Message) -> Result<StreamOpenRequest, ProtocolError> {
    let open: StreamOpenRequest = msg.require_payload()?;
    open.validate()?;
    Ok(open)
}

/// Tells the peer why the connection is being dropped, then hands the error
/// back for propagation.
async fn reject<R, W>(conn: &mut Connection<R, W>, msg: &Message, err: SessionError) -> SessionError
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let code = match err.class() {
        ErrorClass::Resource => ERR_STORAGE,
        ErrorClass::Cancelled => ERR_UNAVAILABLE,
        ErrorClass::Protocol | ErrorClass::Integrity => ERR_PROTOCOL,
    };
    let _ = conn.send(&msg.reply_error(code, err.to_string())).await;
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chunkvault_protocol::DigestAlgorithm;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Half = Connection<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair() -> (Half, Half) {
        let (a, b) = tokio::io::duplex(2 * 1024 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Connection::new(ar, aw), Connection::new(br, bw))
    }

    fn spawn_receiver(
        index: ChunkIndex,
        mut conn: Half,
    ) -> tokio::task::JoinHandle<(Result<(), SessionError>, ReceiverSummary)> {
        tokio::spawn(async move {
            let mut rx = Receiver::new(index, 1, CancellationToken::new(), Duration::ZERO);
            let result = rx.run(&mut conn).await;
            (result, rx.into_summary())
        })
    }

    fn open_req(job: &str) -> StreamOpenRequest {
        StreamOpenRequest {
            job_id: job.into(),
            stream_id: 0,
            source_host: "web01".into(),
            digest: DigestAlgorithm::Blake3,
        }
    }

    fn descriptor(path: &str, size: u64) -> FileDescriptor {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        FileDescriptor {
            path: path.into(),
            size,
            mode: 0o644,
            owner: 0,
            group: 0,
            mod_time: t,
            access_time: t,
            change_time: t,
            file_type: Default::default(),
            symlink_target: None,
        }
    }

    #[tokio::test]
    async fn rejects_empty_job_id() {
        let (mut client, server) = pair();
        let task = spawn_receiver(ChunkIndex::in_memory(), server);

        let err = client
            .request(MessageType::StreamOpen, Some(&open_req("")))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Remote(ref e) if e.code == ERR_PROTOCOL));

        let (result, summary) = task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::InvalidStreamOpen(_)))
        ));
        assert!(summary.job_id.is_none());
    }

    #[tokio::test]
    async fn rejects_traffic_before_stream_open() {
        let (mut client, server) = pair();
        let task = spawn_receiver(ChunkIndex::in_memory(), server);

        let err = client
            .request(MessageType::FileDescriptor, Some(&descriptor("/a", 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Remote(_)));

        let (result, _) = task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::UnexpectedMessage {
                expected: "stream_open",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn rejects_chunk_before_hash_batch() {
        let (mut client, server) = pair();
        let task = spawn_receiver(ChunkIndex::in_memory(), server);

        client
            .request(MessageType::StreamOpen, Some(&open_req("job")))
            .await
            .unwrap();
        let reply = client
            .request(MessageType::FileDescriptor, Some(&descriptor("/a", 3)))
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::SendFile);

        let chunk = ChunkDataRequest {
            digest: chunk_digest(DigestAlgorithm::Blake3, b"abc"),
            data: b"abc".to_vec(),
        };
        assert!(
            client
                .request(MessageType::ChunkData, Some(&chunk))
                .await
                .is_err()
        );

        let (result, _) = task.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::UnexpectedMessage {
                expected: "hash_batch",
                got: MessageType::ChunkData
            })
        ));
    }

    #[tokio::test]
    async fn rejects_unrequested_digest() {
        let (mut client, server) = pair();
        let task = spawn_receiver(ChunkIndex::in_memory(), server);

        client
            .request(MessageType::StreamOpen, Some(&open_req("job")))
            .await
            .unwrap();
        client
            .request(MessageType::FileDescriptor, Some(&descriptor("/a", 3)))
            .await
            .unwrap();
        let digest = chunk_digest(DigestAlgorithm::Blake3, b"abc");
        let reply = client
            .request(
                MessageType::HashBatch,
                Some(&HashBatchRequest {
                    digests: vec![digest],
                    last: true,
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::NeededDigests);

        let other = ChunkDataRequest {
            digest: chunk_digest(DigestAlgorithm::Blake3, b"xyz"),
            data: b"xyz".to_vec(),
        };
        assert!(
            client
                .request(MessageType::ChunkData, Some(&other))
                .await
                .is_err()
        );
        let (result, _) = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::UnknownDigest(_))));
    }

    #[tokio::test]
    async fn empty_file_commits_with_zero_crc() {
        let index = ChunkIndex::in_memory();
        let (mut client, server) = pair();
        let task = spawn_receiver(index.clone(), server);

        client
            .request(MessageType::StreamOpen, Some(&open_req("job")))
            .await
            .unwrap();
        client
            .request(MessageType::FileDescriptor, Some(&descriptor("/empty", 0)))
            .await
            .unwrap();
        let reply = client
            .request(
                MessageType::HashBatch,
                Some(&HashBatchRequest {
                    digests: vec![],
                    last: true,
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::SkipBatch);

        let reply = client
            .request(
                MessageType::FileChecksum,
                Some(&FileChecksumRequest { crc32: 0, size: 0 }),
            )
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::FileOk);
        client.request_bare(MessageType::StreamClose).await.unwrap();

        let (result, summary) = task.await.unwrap();
        result.unwrap();
        assert_eq!(summary.files_committed, 1);
        let rec = index.latest_file("/empty", "web01").unwrap().unwrap();
        assert!(rec.chunks.is_empty());
        assert_eq!(rec.crc32, 0);
    }

    #[tokio::test]
    async fn length_mismatch_is_not_committed() {
        let index = ChunkIndex::in_memory();
        let (mut client, server) = pair();
        let task = spawn_receiver(index.clone(), server);

        client
            .request(MessageType::StreamOpen, Some(&open_req("job")))
            .await
            .unwrap();
        // Descriptor and checksum both claim 4 bytes; the only chunk has 3.
        client
            .request(MessageType::FileDescriptor, Some(&descriptor("/short", 4)))
            .await
            .unwrap();
        let digest = chunk_digest(DigestAlgorithm::Blake3, b"abc");
        client
            .request(
                MessageType::HashBatch,
                Some(&HashBatchRequest {
                    digests: vec![digest],
                    last: true,
                }),
            )
            .await
            .unwrap();
        client
            .request(
                MessageType::ChunkData,
                Some(&ChunkDataRequest {
                    digest,
                    data: b"abc".to_vec(),
                }),
            )
            .await
            .unwrap();
        let reply = client
            .request(
                MessageType::FileChecksum,
                Some(&FileChecksumRequest {
                    crc32: crc32fast::hash(b"abc"),
                    size: 4,
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::FileChecksumError);
        let body: FileChecksumErrorResponse = reply.require_payload().unwrap();
        assert!(body.reason.contains("chunk lengths"));

        client.request_bare(MessageType::StreamClose).await.unwrap();
        let (result, summary) = task.await.unwrap();
        result.unwrap();
        assert_eq!(summary.files_failed, 1);
        assert!(index.latest_file("/short", "web01").unwrap().is_none());
        // Verified chunks stay.
        assert!(index.chunk_record(&digest).unwrap().is_some());
    }

    #[tokio::test]
    async fn file_abort_returns_to_ready() {
        let (mut client, server) = pair();
        let task = spawn_receiver(ChunkIndex::in_memory(), server);

        client
            .request(MessageType::StreamOpen, Some(&open_req("job")))
            .await
            .unwrap();
        client
            .request(MessageType::FileDescriptor, Some(&descriptor("/gone", 10)))
            .await
            .unwrap();
        let reply = client
            .request(
                MessageType::FileAbort,
                Some(&FileAbortRequest {
                    reason: "permission denied".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::FileAbortAck);

        let reply = client
            .request(MessageType::FileDescriptor, Some(&descriptor("/next", 0)))
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::SendFile);
        drop(client);

        let (result, summary) = task.await.unwrap();
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
        assert_eq!(summary.files_aborted, 1);
        assert_eq!(summary.files_committed, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_receiver() {
        let (_client, mut server) = pair();
        let cancel = CancellationToken::new();
        let mut rx = Receiver::new(ChunkIndex::in_memory(), 7, cancel.clone(), Duration::ZERO);
        cancel.cancel();
        let err = rx.run(&mut server).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
    }
}
