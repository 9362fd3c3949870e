//! CRC32 combination without the underlying bytes.
//!
//! CRC32 is linear over GF(2): appending `len2` bytes to a message whose CRC
//! is `crc1` transforms `crc1` by a fixed 32x32 bit matrix that depends only
//! on `len2`. The matrix for `len2` zero bytes is built by repeated squaring
//! of the one-zero-bit operator, so combining costs O(log len2).

/// Reflected IEEE 802.3 polynomial.
const POLY: u32 = 0xEDB8_8320;

const GF2_DIM: usize = 32;

type Gf2Matrix = [u32; GF2_DIM];

fn gf2_matrix_times(mat: &Gf2Matrix, mut vec: u32) -> u32 {
    let mut sum = 0;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(mat: &Gf2Matrix) -> Gf2Matrix {
    let mut square = [0u32; GF2_DIM];
    for (n, row) in square.iter_mut().enumerate() {
        *row = gf2_matrix_times(mat, mat[n]);
    }
    square
}

/// Returns the CRC32 of `A || B` given `crc(A)`, `crc(B)` and `len(B)`.
pub fn crc32_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    // Operator for one zero bit.
    let mut odd: Gf2Matrix = [0; GF2_DIM];
    odd[0] = POLY;
    let mut row = 1u32;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    // Two zero bits, then four.
    let mut even = gf2_matrix_square(&odd);
    odd = gf2_matrix_square(&even);

    // First squaring below yields the one-zero-byte operator.
    let mut crc1 = crc1;
    let mut len2 = len2;
    loop {
        even = gf2_matrix_square(&odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        odd = gf2_matrix_square(&even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

/// Declared chunk lengths disagree with the file size.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CombineError {
    #[error("chunk lengths sum to {actual} bytes, file declares {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// Folds ordered `(crc32, length)` pairs into a whole-stream CRC32.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32Combiner {
    crc: u32,
    len: u64,
}

impl Crc32Combiner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the next range.
    pub fn push(&mut self, crc: u32, len: u64) {
        self.crc = crc32_combine(self.crc, crc, len);
        self.len += len;
    }

    /// Total bytes covered so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Returns the combined CRC32, checking the covered length.
    pub fn finish(&self, expected_len: u64) -> Result<u32, CombineError> {
        if self.len != expected_len {
            return Err(CombineError::LengthMismatch {
                expected: expected_len,
                actual: self.len,
            });
        }
        Ok(self.crc)
    }
}

/// Combines `parts` in order and checks they cover exactly `expected_len` bytes.
pub fn combine_all<I>(parts: I, expected_len: u64) -> Result<u32, CombineError>
where
    I: IntoIterator<Item = (u32, u64)>,
{
    let mut combiner = Crc32Combiner::new();
    for (crc, len) in parts {
        combiner.push(crc, len);
    }
    combiner.finish(expected_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn combine_two_halves() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let (a, b) = data.split_at(17);
        let combined = crc32_combine(crc32fast::hash(a), crc32fast::hash(b), b.len() as u64);
        assert_eq!(combined, crc32fast::hash(data));
    }

    #[test]
    fn empty_right_side_is_identity() {
        let crc = crc32fast::hash(b"abc");
        assert_eq!(crc32_combine(crc, 0, 0), crc);
    }

    #[test]
    fn empty_left_side() {
        let crc = crc32fast::hash(b"payload");
        assert_eq!(crc32_combine(0, crc, 7), crc);
    }

    #[test]
    fn matches_crc32fast_combine_on_large_lengths() {
        let a = vec![0x11u8; 512 * 1024];
        let b = vec![0x22u8; 309_658];

        let mut expected = crc32fast::Hasher::new();
        expected.update(&a);
        expected.update(&b);

        let got = crc32_combine(crc32fast::hash(&a), crc32fast::hash(&b), b.len() as u64);
        assert_eq!(got, expected.finalize());
    }

    #[test]
    fn combiner_reports_length_mismatch() {
        let mut c = Crc32Combiner::new();
        c.push(crc32fast::hash(b"abcd"), 4);
        assert!(c.finish(4).is_ok());
        assert_eq!(
            c.finish(5),
            Err(CombineError::LengthMismatch {
                expected: 5,
                actual: 4
            })
        );
    }

    #[test]
    fn combine_all_empty_is_zero() {
        assert_eq!(combine_all(std::iter::empty(), 0), Ok(0));
    }

    fn chunked_sequences() -> impl Strategy<Value = Vec<Vec<u8>>> {
        prop::collection::vec(prop::collection::vec(any::<u8>(), 0..=2048), 1..=12)
    }

    proptest! {
        #[test]
        fn combining_chunks_matches_whole_stream(chunks in chunked_sequences()) {
            let whole: Vec<u8> = chunks.concat();
            let parts = chunks
                .iter()
                .map(|c| (crc32fast::hash(c), c.len() as u64));
            let combined = combine_all(parts, whole.len() as u64).unwrap();
            prop_assert_eq!(combined, crc32fast::hash(&whole));
        }

        #[test]
        fn fixed_size_partition_matches(
            data in prop::collection::vec(any::<u8>(), 0..=8192),
            size in 1usize..=1024,
        ) {
            let mut c = Crc32Combiner::new();
            for chunk in data.chunks(size) {
                c.push(crc32fast::hash(chunk), chunk.len() as u64);
            }
            prop_assert_eq!(c.finish(data.len() as u64).unwrap(), crc32fast::hash(&data));
        }
    }
}
