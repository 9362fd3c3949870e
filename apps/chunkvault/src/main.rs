//! chunkvault entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Deduplicating, chunked backup over parallel streams.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file (default: ~/.config/chunkvault/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, global = true, conflicts_with = "quiet")]
    debug: bool,

    /// Log warnings and errors only
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive backup streams
    Serve {
        /// Port to listen on (default: config `default_port`)
        #[arg(long)]
        port: Option<u16>,

        /// Storage directory (default: config `storage_path`)
        #[arg(long)]
        storage: Option<PathBuf>,
    },

    /// Back up a directory tree
    Backup {
        /// Directory or file to back up
        root: PathBuf,

        /// Receiver address, host:port
        #[arg(long)]
        server: Option<String>,

        /// Parallel streams (default: config `default_streams`)
        #[arg(short = 'n', long)]
        streams: Option<usize>,

        /// Job id (default: random)
        #[arg(long)]
        job_id: Option<String>,

        /// Source host recorded with every file (default: hostname)
        #[arg(long)]
        host: Option<String>,
    },

    /// Restore the latest version of a file from local storage
    Restore {
        /// Path as it was backed up
        path: String,

        /// Where to write the restored bytes
        #[arg(short, long)]
        out: PathBuf,

        /// Source host (default: hostname)
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        storage: Option<PathBuf>,
    },

    /// List every backed-up version of a file
    History {
        path: String,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        storage: Option<PathBuf>,

        /// One JSON record per line
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config::Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config))
}

async fn run(command: Command, config: config::Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, shutting down");
            on_signal.cancel();
        }
    });

    match command {
        Command::Serve { port, storage } => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chunkvault server");
            app::serve(&config, port, storage, cancel).await
        }
        Command::Backup {
            root,
            server,
            streams,
            job_id,
            host,
        } => {
            let opts = app::BackupOptions {
                root,
                server,
                streams,
                job_id,
                source_host: host,
            };
            let report = app::backup(&config, opts, cancel).await?;

            println!(
                "job {}: {} transferred, {} unchanged, {} failed, {} bytes sent, {} chunks deduplicated",
                report.job_id,
                report.files_transferred(),
                report.files_skipped(),
                report.files_failed(),
                report.bytes_sent(),
                report.chunks_deduplicated(),
            );
            for stream in report.failed_streams() {
                if let Some(e) = &stream.error {
                    eprintln!("stream {}: {e}", stream.stream_id);
                }
            }
            if !report.is_success() {
                anyhow::bail!("backup job {} failed", report.job_id);
            }
            Ok(())
        }
        Command::Restore {
            path,
            out,
            host,
            storage,
        } => {
            let host = host.unwrap_or_else(app::default_host);
            let record = app::restore(&config, storage, &path, &host, &out).await?;
            println!(
                "restored {} ({} bytes, backed up {})",
                record.path, record.size, record.backup_time
            );
            Ok(())
        }
        Command::History {
            path,
            host,
            storage,
            json,
        } => {
            let host = host.unwrap_or_else(app::default_host);
            for record in app::history(&config, storage, &path, &host)? {
                if json {
                    println!("{}", serde_json::to_string(&record)?);
                } else {
                    println!(
                        "{}  {:>12}  {:08x}  {}  {}",
                        record.backup_time,
                        record.size,
                        record.crc32,
                        record.file_digest.short(),
                        record.job_id
                    );
                }
            }
            Ok(())
        }
    }
}
