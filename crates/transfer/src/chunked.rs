use std::io::ErrorKind;

use chunkvault_protocol::{Digest, DigestAlgorithm};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::digest::{chunk_crc32, chunk_digest};
use crate::{MAX_CHUNK_SIZE, TransferError};

/// One contiguous range of a source file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Ordinal within the file, from 0.
    pub index: u64,
    /// Byte offset within the file.
    pub offset: u64,
    /// Raw chunk data.
    pub data: Vec<u8>,
    pub digest: Digest,
    /// CRC32 of `data` alone.
    pub crc32: u32,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reading the source failed partway through.
#[derive(Debug, thiserror::Error)]
#[error("source read failed at byte {offset}: {source}")]
pub struct SourceReadError {
    /// Bytes successfully read before the failure.
    pub offset: u64,
    #[source]
    pub source: std::io::Error,
}

/// Splits a byte source into fixed-size chunks in a single pass.
///
/// Every chunk is digested as it is produced, and its bytes are folded into
/// a running CRC32 of the whole file, so the source is read exactly once.
/// Only the final chunk may be shorter than `chunk_size`. An empty source
/// yields no chunks.
pub struct ChunkSplitter<R> {
    source: R,
    chunk_size: usize,
    algorithm: DigestAlgorithm,
    next_index: u64,
    offset: u64,
    file_crc: crc32fast::Hasher,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> ChunkSplitter<R> {
    /// Wraps `source`. `chunk_size` must be within `1..=MAX_CHUNK_SIZE`.
    pub fn new(
        source: R,
        chunk_size: usize,
        algorithm: DigestAlgorithm,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            source,
            chunk_size,
            algorithm,
            next_index: 0,
            offset: 0,
            file_crc: crc32fast::Hasher::new(),
            exhausted: false,
        })
    }

    /// Reads the next chunk. Returns `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, SourceReadError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.source.read(&mut buf[filled..]).await {
                Ok(0) => {
                    self.exhausted = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.exhausted = true;
                    return Err(SourceReadError {
                        offset: self.offset + filled as u64,
                        source: e,
                    });
                }
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);

        self.file_crc.update(&buf);
        let chunk = Chunk {
            index: self.next_index,
            offset: self.offset,
            digest: chunk_digest(self.algorithm, &buf),
            crc32: chunk_crc32(&buf),
            data: buf,
        };
        self.next_index += 1;
        self.offset += filled as u64;
        Ok(Some(chunk))
    }

    /// CRC32 over every byte produced so far.
    pub fn file_crc(&self) -> u32 {
        self.file_crc.clone().finalize()
    }

    /// Bytes produced so far.
    pub fn bytes_read(&self) -> u64 {
        self.offset
    }

    /// Chunks produced so far.
    pub fn chunks_read(&self) -> u64 {
        self.next_index
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    use super::*;
    use crate::combine::combine_all;

    async fn collect<R: AsyncRead + Unpin>(splitter: &mut ChunkSplitter<R>) -> Vec<Chunk> {
        let mut out = Vec::new();
        while let Some(c) = splitter.next_chunk().await.unwrap() {
            out.push(c);
        }
        out
    }

    #[tokio::test]
    async fn splits_exactly_once_in_order() {
        let data = b"AABBCCDDEE";
        let mut s = ChunkSplitter::new(&data[..], 4, DigestAlgorithm::Blake3).unwrap();
        let chunks = collect(&mut s).await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0].data, b"AABB");
        assert_eq!(chunks[1].offset, 4);
        assert_eq!(&chunks[2].data, b"EE");
        assert_eq!(chunks[2].index, 2);
        assert_eq!(s.bytes_read(), 10);
        assert_eq!(s.file_crc(), crc32fast::hash(data));
        assert!(s.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunk_digests_and_crcs_match_content() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut s = ChunkSplitter::new(&data[..], 1024, DigestAlgorithm::Sha256).unwrap();
        for c in collect(&mut s).await {
            assert_eq!(c.digest, chunk_digest(DigestAlgorithm::Sha256, &c.data));
            assert_eq!(c.crc32, crc32fast::hash(&c.data));
        }
    }

    #[tokio::test]
    async fn exact_multiple_has_no_trailing_empty_chunk() {
        let data = vec![7u8; 8];
        let mut s = ChunkSplitter::new(&data[..], 4, DigestAlgorithm::Blake3).unwrap();
        let chunks = collect(&mut s).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 4));
    }

    #[tokio::test]
    async fn empty_source_yields_nothing() {
        let mut s = ChunkSplitter::new(&b""[..], 4, DigestAlgorithm::Blake3).unwrap();
        assert!(s.next_chunk().await.unwrap().is_none());
        assert_eq!(s.file_crc(), 0);
        assert_eq!(s.bytes_read(), 0);
    }

    #[tokio::test]
    async fn one_point_three_mib_gives_three_chunks() {
        let len = 2 * MAX_CHUNK_SIZE + 309_658;
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        let mut s = ChunkSplitter::new(&data[..], MAX_CHUNK_SIZE, DigestAlgorithm::Blake3).unwrap();
        let chunks = collect(&mut s).await;

        let lens: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(lens, vec![MAX_CHUNK_SIZE, MAX_CHUNK_SIZE, 309_658]);

        let combined = combine_all(
            chunks.iter().map(|c| (c.crc32, c.len() as u64)),
            len as u64,
        )
        .unwrap();
        assert_eq!(combined, s.file_crc());
    }

    #[test]
    fn rejects_bad_chunk_size() {
        assert!(ChunkSplitter::new(&b""[..], 0, DigestAlgorithm::Blake3).is_err());
        assert!(
            ChunkSplitter::new(&b""[..], MAX_CHUNK_SIZE + 1, DigestAlgorithm::Blake3).is_err()
        );
    }

    /// Yields `ok` bytes, then fails.
    struct FailingReader {
        ok: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.ok == 0 {
                return Poll::Ready(Err(std::io::Error::other("disk gone")));
            }
            let n = self.ok.min(buf.remaining()).min(3);
            buf.put_slice(&vec![1u8; n]);
            self.ok -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_error_carries_offset() {
        let mut s = ChunkSplitter::new(FailingReader { ok: 10 }, 4, DigestAlgorithm::Blake3)
            .unwrap();
        assert_eq!(s.next_chunk().await.unwrap().unwrap().len(), 4);
        assert_eq!(s.next_chunk().await.unwrap().unwrap().len(), 4);

        let err = s.next_chunk().await.unwrap_err();
        assert_eq!(err.offset, 10);
        assert!(s.next_chunk().await.unwrap().is_none());
    }
}
