//! CRC32 helpers
//!
//! Every block of a superpack (footer info, file table, metadata, each
//! compressed file) is guarded by a standard IEEE CRC32. The checksum comes
//! from `flate2::Crc`, the same zlib polynomial the archive tools use.

use flate2::Crc;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Compute the CRC32 of a buffer
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Check a buffer against an expected CRC32
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

/// Compute the CRC32 of a whole file without loading it into memory
pub fn crc32_file(path: impl AsRef<Path>) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut crc = Crc::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        crc.update(&buffer[..read]);
    }
    Ok(crc.sum())
}

/// Incremental CRC32 for data that arrives in pieces
#[derive(Debug)]
pub struct Crc32Hasher {
    inner: Crc,
}

impl Crc32Hasher {
    /// Start a new checksum
    pub fn new() -> Self {
        Self { inner: Crc::new() }
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Current checksum value
    pub fn sum(&self) -> u32 {
        self.inner.sum()
    }

    /// Number of bytes hashed so far
    pub fn amount(&self) -> u32 {
        self.inner.amount()
    }

    /// Forget everything hashed so far
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl Default for Crc32Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_known_vector() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"superpack footer info block";
        let mut hasher = Crc32Hasher::new();
        hasher.update(&data[..7]);
        hasher.update(&data[7..]);
        assert_eq!(hasher.sum(), crc32(data));
        assert_eq!(hasher.amount() as usize, data.len());

        hasher.reset();
        assert_eq!(hasher.sum(), 0);
    }

    #[test]
    fn test_file_crc() {
        let mut file = tempfile::NamedTempFile::new().expect("Operation should succeed");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).expect("Operation should succeed");
        file.flush().expect("Operation should succeed");

        let from_file = crc32_file(file.path()).expect("Operation should succeed");
        assert_eq!(from_file, crc32(&data));
    }

    #[test]
    fn test_single_bit_flip_detected_on_corpus() {
        let corpus: [&[u8]; 4] = [
            b"a",
            b"DVPK",
            b"packs/base/textures/atlas.png",
            &[0u8; 257],
        ];
        for buffer in corpus {
            let expected = crc32(buffer);
            for byte in 0..buffer.len() {
                for bit in 0..8 {
                    let mut flipped = buffer.to_vec();
                    flipped[byte] ^= 1 << bit;
                    assert!(!verify_crc32(&flipped, expected));
                }
            }
        }
    }

    proptest! {
        #[test]
        fn prop_verify_own_crc(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            prop_assert!(verify_crc32(&data, crc32(&data)));
        }

        #[test]
        fn prop_bit_flip_fails(
            data in proptest::collection::vec(any::<u8>(), 1..1024),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let expected = crc32(&data);
            let mut flipped = data.clone();
            let i = index.index(flipped.len());
            flipped[i] ^= 1 << bit;
            prop_assert!(!verify_crc32(&flipped, expected));
        }
    }
}
