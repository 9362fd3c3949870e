use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;

use chunkvault_protocol::FileDescriptor;
use tokio::io::AsyncRead;

/// A boxed future returned by [`SourceProvider::open`].
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = std::io::Result<T>> + Send + 'a>>;

/// Opens the readable byte source behind a descriptor.
pub trait SourceProvider: Send + Sync {
    type Reader: AsyncRead + Unpin + Send;

    fn open<'a>(&'a self, file: &'a FileDescriptor) -> SourceFuture<'a, Self::Reader>;
}

/// Reads descriptors' paths from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSource;

impl SourceProvider for FsSource {
    type Reader = tokio::fs::File;

    fn open<'a>(&'a self, file: &'a FileDescriptor) -> SourceFuture<'a, Self::Reader> {
        Box::pin(tokio::fs::File::open(&file.path))
    }
}

/// Serves file contents from memory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, data: Vec<u8>) {
        self.files.insert(path.into(), data);
    }
}

impl SourceProvider for MemorySource {
    type Reader = Cursor<Vec<u8>>;

    fn open<'a>(&'a self, file: &'a FileDescriptor) -> SourceFuture<'a, Self::Reader> {
        Box::pin(async move {
            self.files
                .get(&file.path)
                .cloned()
                .map(Cursor::new)
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} not found", file.path),
                    )
                })
        })
    }
}
