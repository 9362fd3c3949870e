use chunkvault_protocol::{Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256};

/// Computes the content digest of one chunk.
pub fn chunk_digest(algorithm: DigestAlgorithm, data: &[u8]) -> Digest {
    match algorithm {
        DigestAlgorithm::Blake3 => Digest::from_bytes(*blake3::hash(data).as_bytes()),
        DigestAlgorithm::Sha256 => Digest::from_bytes(Sha256::digest(data).into()),
    }
}

/// CRC32 (IEEE) of one chunk.
pub fn chunk_crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Identity of a whole file: the digest over its ordered chunk digests.
///
/// Two files with the same content produce the same value regardless of
/// path or host.
pub fn file_digest(algorithm: DigestAlgorithm, chunks: &[Digest]) -> Digest {
    match algorithm {
        DigestAlgorithm::Blake3 => {
            let mut hasher = blake3::Hasher::new();
            for d in chunks {
                hasher.update(d.as_bytes());
            }
            Digest::from_bytes(*hasher.finalize().as_bytes())
        }
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            for d in chunks {
                hasher.update(d.as_bytes());
            }
            Digest::from_bytes(hasher.finalize().into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_known_vector() {
        let d = chunk_digest(DigestAlgorithm::Blake3, b"");
        assert_eq!(
            d.to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn sha256_known_vector() {
        let d = chunk_digest(DigestAlgorithm::Sha256, b"abc");
        assert_eq!(
            d.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn algorithms_differ() {
        assert_ne!(
            chunk_digest(DigestAlgorithm::Blake3, b"data"),
            chunk_digest(DigestAlgorithm::Sha256, b"data")
        );
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(chunk_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(chunk_crc32(b""), 0);
    }

    #[test]
    fn file_digest_depends_on_order() {
        let a = chunk_digest(DigestAlgorithm::Blake3, b"a");
        let b = chunk_digest(DigestAlgorithm::Blake3, b"b");
        assert_ne!(
            file_digest(DigestAlgorithm::Blake3, &[a, b]),
            file_digest(DigestAlgorithm::Blake3, &[b, a])
        );
        assert_eq!(
            file_digest(DigestAlgorithm::Sha256, &[a, b]),
            file_digest(DigestAlgorithm::Sha256, &[a, b])
        );
    }
}
