//! Subcommand implementations, wiring the library crates together.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use chunkvault_coordinator::{JobReport, JobSpec, StreamCoordinator, TcpConnector};
use chunkvault_index::{ChunkIndex, FileRecord};
use chunkvault_server::{BackupServer, ServerConfig};
use chunkvault_session::FsSource;
use chunkvault_transfer::scan_files;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Options for one `backup` run; unset fields fall back to the config.
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub root: PathBuf,
    pub server: Option<String>,
    pub streams: Option<usize>,
    pub job_id: Option<String>,
    pub source_host: Option<String>,
}

/// Runs the receiver until `cancel` fires.
pub async fn serve(
    config: &Config,
    port: Option<u16>,
    storage: Option<PathBuf>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let storage = storage.unwrap_or_else(|| config.storage_path.clone());
    let index = ChunkIndex::open_dir(&storage)
        .with_context(|| format!("opening storage at {}", storage.display()))?;
    let stats = index.stats();
    tracing::info!(
        storage = %storage.display(),
        chunks = stats.chunks,
        file_versions = stats.file_versions,
        "index loaded"
    );

    let server = BackupServer::new(
        ServerConfig {
            port: port.unwrap_or(config.default_port),
            session_timeout: config.session_timeout(),
        },
        index,
    );

    tokio::select! {
        result = server.run() => result?,
        _ = cancel.cancelled() => {
            tracing::info!("shutdown signal received");
            server.shutdown();
        }
    }

    for (job_id, stats) in server.jobs().snapshot() {
        tracing::info!(
            %job_id,
            streams_completed = stats.streams_completed,
            streams_failed = stats.streams_failed,
            files_committed = stats.files_committed,
            bytes_received = stats.bytes_received,
            "job totals"
        );
    }
    Ok(())
}

/// Scans `opts.root` and backs it up over parallel streams.
pub async fn backup(
    config: &Config,
    opts: BackupOptions,
    cancel: CancellationToken,
) -> anyhow::Result<JobReport> {
    let root = opts.root.clone();
    let files = tokio::task::spawn_blocking(move || scan_files(&root))
        .await?
        .with_context(|| format!("scanning {}", opts.root.display()))?;
    tracing::info!(root = %opts.root.display(), files = files.len(), "scan complete");

    let server = opts
        .server
        .unwrap_or_else(|| format!("127.0.0.1:{}", config.default_port));
    let job = JobSpec {
        job_id: opts
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        source_host: opts.source_host.unwrap_or_else(default_host),
        streams: opts.streams.unwrap_or(config.default_streams),
        policy: config.policy(),
        session_timeout: config.session_timeout(),
    };

    let connector = TcpConnector::new(server, config.connection_timeout());
    let coordinator = StreamCoordinator::new(connector, FsSource);

    // Forward outside cancellation to the job.
    let job_cancel = coordinator.cancel_token();
    let forward = tokio::spawn(async move {
        cancel.cancelled().await;
        job_cancel.cancel();
    });
    let report = coordinator.run(&job, files).await;
    forward.abort();
    Ok(report?)
}

/// Writes the latest committed version of `path` to `out`.
pub async fn restore(
    config: &Config,
    storage: Option<PathBuf>,
    path: &str,
    source_host: &str,
    out: &Path,
) -> anyhow::Result<FileRecord> {
    let index = open_storage(config, storage)?;
    let Some(record) = index.latest_file(path, source_host)? else {
        bail!("no backup of {path} from {source_host}");
    };

    let mut file = tokio::fs::File::create(out)
        .await
        .with_context(|| format!("creating {}", out.display()))?;
    let written = index.restore_file(&record, &mut file).await?;
    file.sync_all().await?;
    tracing::info!(%path, out = %out.display(), bytes = written, "restored");
    Ok(record)
}

/// Every committed version of `path`, oldest first.
pub fn history(
    config: &Config,
    storage: Option<PathBuf>,
    path: &str,
    source_host: &str,
) -> anyhow::Result<Vec<FileRecord>> {
    let index = open_storage(config, storage)?;
    Ok(index.file_history(path, source_host)?)
}

fn open_storage(config: &Config, storage: Option<PathBuf>) -> anyhow::Result<ChunkIndex> {
    let storage = storage.unwrap_or_else(|| config.storage_path.clone());
    ChunkIndex::open_dir(&storage).with_context(|| format!("opening storage at {}", storage.display()))
}

pub fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into())
}
