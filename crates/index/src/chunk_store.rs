use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{PoisonError, RwLock};

use chunkvault_protocol::Digest;
use chunkvault_transfer::validate_relative_path;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::error::IndexError;

/// A boxed future returned by chunk store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IndexError>> + Send + 'a>>;

/// Content-addressed storage for chunk bytes.
///
/// Writes are idempotent per digest: storing identical bytes twice, even
/// concurrently, leaves one readable copy.
pub trait ChunkStore: Send + Sync + 'static {
    /// Stores `data` and returns its location.
    fn write_chunk<'a>(&'a self, digest: &'a Digest, data: &'a [u8]) -> StoreFuture<'a, String>;

    /// Reads back the bytes at `location`.
    fn read_chunk<'a>(&'a self, location: &'a str) -> StoreFuture<'a, Vec<u8>>;
}

/// Chunk files under a root directory, fanned out by the first digest byte.
///
/// ```text
/// <root>/ab/ab12...ef
/// ```
#[derive(Debug, Clone)]
pub struct DirChunkStore {
    root: PathBuf,
}

impl DirChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn location_for(digest: &Digest) -> String {
        let hex = digest.to_hex();
        format!("{}/{}", &hex[..2], hex)
    }
}

impl ChunkStore for DirChunkStore {
    fn write_chunk<'a>(&'a self, digest: &'a Digest, data: &'a [u8]) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let location = Self::location_for(digest);
            let final_path = self.root.join(&location);
            if tokio::fs::try_exists(&final_path).await? {
                return Ok(location);
            }

            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // Unique temp name so racing writers never share a file.
            let tmp_path = final_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
            if let Err(e) = write_synced(&tmp_path, data).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
            if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }

            trace!(digest = %digest.short(), len = data.len(), "chunk written");
            Ok(location)
        })
    }

    fn read_chunk<'a>(&'a self, location: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            validate_relative_path(location)?;
            Ok(tokio::fs::read(self.root.join(location)).await?)
        })
    }
}

/// Writes `data` and flushes it to disk before the file is renamed into place.
async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_data().await
}

/// Chunk bytes held in memory.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChunkStore for MemoryChunkStore {
    fn write_chunk<'a>(&'a self, digest: &'a Digest, data: &'a [u8]) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let location = digest.to_hex();
            self.chunks
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(location.clone())
                .or_insert_with(|| data.to_vec());
            Ok(location)
        })
    }

    fn read_chunk<'a>(&'a self, location: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.chunks
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(location)
                .cloned()
                .ok_or_else(|| {
                    IndexError::from(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("chunk {location} not found"),
                    ))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn dir_store_roundtrip_and_layout() {
        let dir = TempDir::new().unwrap();
        let store = DirChunkStore::new(dir.path());
        let digest = Digest::from_bytes([0xab; 32]);

        let location = store.write_chunk(&digest, b"chunk bytes").await.unwrap();
        assert!(location.starts_with("ab/abab"));
        assert_eq!(store.read_chunk(&location).await.unwrap(), b"chunk bytes");

        let again = store.write_chunk(&digest, b"chunk bytes").await.unwrap();
        assert_eq!(again, location);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("ab"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn dir_store_concurrent_writes_of_same_digest() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(DirChunkStore::new(dir.path()));
        let digest = Digest::from_bytes([0x42; 32]);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.write_chunk(&digest, &[9u8; 4096]).await.unwrap()
            }));
        }
        let mut locations = Vec::new();
        for t in tasks {
            locations.push(t.await.unwrap());
        }
        locations.dedup();
        assert_eq!(locations.len(), 1);
        assert_eq!(store.read_chunk(&locations[0]).await.unwrap(), vec![9u8; 4096]);
    }

    #[tokio::test]
    async fn dir_store_rejects_escaping_location() {
        let dir = TempDir::new().unwrap();
        let store = DirChunkStore::new(dir.path());
        let err = store.read_chunk("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, IndexError::InvalidLocation(_)));
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryChunkStore::new();
        let digest = Digest::from_bytes([1; 32]);
        let loc = store.write_chunk(&digest, b"abc").await.unwrap();
        store.write_chunk(&digest, b"abc").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.read_chunk(&loc).await.unwrap(), b"abc");
        assert!(store.read_chunk("missing").await.is_err());
    }
}
