//! chunkvault configuration management.
//!
//! Configuration is stored as TOML at `~/.config/chunkvault/config.toml`
//! unless `--config` names another file. Every field has a default, so a
//! partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use chunkvault_protocol::DigestAlgorithm;
use chunkvault_protocol::constants::{MAX_CHUNK_SIZE, MAX_HASH_BATCH};
use chunkvault_session::{FailurePolicy, SessionPolicy};
use serde::{Deserialize, Serialize};

/// Upper bound on `chunk_retries`.
const MAX_CHUNK_RETRIES: u32 = 16;

/// chunkvault configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Port the server listens on and the client dials by default.
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Parallel streams per backup job.
    #[serde(default = "default_streams")]
    pub default_streams: usize,

    /// Digests offered per hash batch.
    #[serde(default = "default_hash_batch_size")]
    pub hash_batch_size: usize,

    /// Chunk size in bytes, at most 512 KiB.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// TCP connect timeout.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Whole-stream deadline, 0 for none.
    #[serde(default)]
    pub session_timeout_secs: u64,

    /// Resends of a chunk that failed verification.
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,

    /// Stop a stream at its first failed file instead of moving on.
    #[serde(default)]
    pub stop_stream_on_file_error: bool,

    #[serde(default)]
    pub digest: DigestAlgorithm,

    /// Where the server keeps its index and chunks.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
}

fn default_port() -> u16 {
    9040
}

fn default_streams() -> usize {
    4
}

fn default_hash_batch_size() -> usize {
    16
}

fn default_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_chunk_retries() -> u32 {
    1
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

fn default_storage_path() -> PathBuf {
    home().join(".local").join("share").join("chunkvault")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            default_streams: default_streams(),
            hash_batch_size: default_hash_batch_size(),
            chunk_size: default_chunk_size(),
            connection_timeout_secs: default_connection_timeout(),
            session_timeout_secs: 0,
            chunk_retries: default_chunk_retries(),
            stop_stream_on_file_error: false,
            digest: DigestAlgorithm::default(),
            storage_path: default_storage_path(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the default location), creating
    /// a default file if none exists.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path(),
        };

        let config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            let config = Config::default();
            config.save(&path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            bail!("chunk_size must be between 1 and {MAX_CHUNK_SIZE}");
        }
        if self.hash_batch_size == 0 || self.hash_batch_size > MAX_HASH_BATCH {
            bail!("hash_batch_size must be between 1 and {MAX_HASH_BATCH}");
        }
        if self.default_streams == 0 {
            bail!("default_streams must be at least 1");
        }
        if self.chunk_retries > MAX_CHUNK_RETRIES {
            bail!("chunk_retries must be at most {MAX_CHUNK_RETRIES}");
        }
        Ok(())
    }

    pub fn policy(&self) -> SessionPolicy {
        SessionPolicy {
            chunk_size: self.chunk_size,
            hash_batch_size: self.hash_batch_size,
            chunk_retries: self.chunk_retries,
            on_file_error: if self.stop_stream_on_file_error {
                FailurePolicy::AbortStream
            } else {
                FailurePolicy::AbortFile
            },
            digest: self.digest,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

/// Default configuration file path.
fn config_path() -> PathBuf {
    home().join(".config").join("chunkvault").join("config.toml")
}
