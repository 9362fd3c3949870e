//! Backup TCP server.
//!
//! Listens on a TCP port and serves every accepted connection as an
//! independent stream. Streams share the index and nothing else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chunkvault_index::ChunkIndex;
use chunkvault_session::{Connection, Receiver};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::jobs::JobRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Per-connection deadline. Zero means none.
    pub session_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            session_timeout: Duration::ZERO,
        }
    }
}

/// The backup receiver server.
pub struct BackupServer {
    config: ServerConfig,
    index: ChunkIndex,
    jobs: Arc<JobRegistry>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    next_connection_id: AtomicU32,
    running: AtomicBool,
}

impl BackupServer {
    pub fn new(config: ServerConfig, index: ChunkIndex) -> Arc<Self> {
        Arc::new(Self {
            config,
            index,
            jobs: Arc::new(JobRegistry::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            next_connection_id: AtomicU32::new(1),
            running: AtomicBool::new(false),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    /// Stops accepting and cancels every open stream. Files not yet
    /// verified are not committed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("backup server listening on {local_addr}");

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(connection_id, "set_nodelay failed: {e}");
        }
        tracing::info!(connection_id, %peer_addr, "stream connected");

        let (reader, writer) = stream.into_split();
        let mut conn = Connection::new(reader, writer);
        let mut receiver = Receiver::new(
            self.index.clone(),
            connection_id,
            self.cancel.child_token(),
            self.config.session_timeout,
        );

        let completed = receiver.run(&mut conn).await.is_ok();
        let summary = receiver.into_summary();
        self.jobs.record(&summary, completed);

        tracing::info!(
            connection_id,
            %peer_addr,
            completed,
            files_committed = summary.files_committed,
            "stream disconnected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chunkvault_protocol::FileDescriptor;
    use chunkvault_session::{MemorySource, SessionContext, run_stream};

    async fn start() -> (Arc<BackupServer>, tokio::task::JoinHandle<()>, u16) {
        let server = BackupServer::new(ServerConfig::default(), ChunkIndex::in_memory());
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        let mut port = 0;
        for _ in 0..100 {
            port = server.port().await;
            if port > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0, "should have bound to a dynamic port");
        (server, handle, port)
    }

    fn descriptor(path: &str, size: u64) -> FileDescriptor {
        let t = Utc::now();
        FileDescriptor {
            path: path.into(),
            size,
            mode: 0o600,
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
    async fn server_binds_dynamic_port() {
        let (server, handle, _) = start().await;
        assert!(server.local_addr().await.is_some());
        assert!(matches!(
            server.run().await,
            Err(ServerError::AlreadyRunning)
        ));
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_streams_share_one_index() {
        let (server, handle, port) = start().await;

        let mut tasks = Vec::new();
        for stream_id in 0..3u32 {
            tasks.push(tokio::spawn(async move {
                let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let (r, w) = tcp.into_split();
                let path = format!("/srv/file-{stream_id}");
                let mut source = MemorySource::new();
                source.insert(path.clone(), vec![stream_id as u8; 1000]);
                run_stream(
                    Connection::new(r, w),
                    SessionContext::new("job-tcp", stream_id, "host-a"),
                    source,
                    &[descriptor(&path, 1000)],
                )
                .await
            }));
        }
        for task in tasks {
            let report = task.await.unwrap();
            assert!(report.is_success(), "{:?}", report.error);
            assert_eq!(report.transferred(), 1);
        }

        // Receivers record their summary after replying to stream_close.
        let mut stats = None;
        for _ in 0..100 {
            stats = server
                .jobs()
                .get("job-tcp")
                .filter(|s| s.streams_completed == 3);
            if stats.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = stats.unwrap();
        assert_eq!(stats.files_committed, 3);
        assert_eq!(stats.bytes_received, 3000);
        assert_eq!(server.index().stats().file_versions, 3);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_connection_is_counted_nowhere() {
        use tokio::io::AsyncWriteExt;

        let (server, handle, port) = start().await;
        let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        tcp.write_all(b"START_STREAM\n").await.unwrap();
        drop(tcp);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.jobs().snapshot().is_empty());

        server.shutdown();
        handle.await.unwrap();
    }
}
