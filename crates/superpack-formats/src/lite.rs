//! Local fragment ("dvpl") trailer
//!
//! A downloaded file is stored on disk as `<name>.dvpl`: the stored bytes
//! exactly as they appear in the superpack, followed by a 20-byte trailer.
//! The trailer lets a directory scan validate a fragment by reading only the
//! last 20 bytes.
//!
//! Layout (20 bytes, host-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 4    | Original size |
//! | 0x04   | 4    | Stored size |
//! | 0x08   | 4    | CRC32 of stored bytes |
//! | 0x0C   | 4    | Compression type |
//! | 0x10   | 4    | Marker `DVPL` |

use crate::SuperpackFormat;
use crate::compression::{self, CompressionType};
use crate::crc::crc32;
use crate::error::{FormatError, FormatResult};
use binrw::{BinRead, BinWrite};
use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

/// Marker closing every dvpl trailer
pub const LITE_MARKER: [u8; 4] = *b"DVPL";

/// Size of the trailer
pub const LITE_FOOTER_SIZE: usize = 20;

/// File extension of local fragments, without the dot
pub const DVPL_EXTENSION: &str = "dvpl";

/// Trailer appended to every local fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct LiteFooter {
    /// Size after decompression
    pub size_uncompressed: u32,
    /// Size of the stored bytes preceding the trailer
    pub size_compressed: u32,
    /// CRC32 of the stored bytes
    pub crc32_compressed: u32,
    /// Codec of the stored bytes
    pub compression_type: CompressionType,
    /// Must equal [`LITE_MARKER`]
    pub marker: [u8; 4],
}

impl LiteFooter {
    /// Trailer describing already-stored bytes
    pub fn new(
        size_uncompressed: u32,
        size_compressed: u32,
        crc32_compressed: u32,
        compression_type: CompressionType,
    ) -> Self {
        Self {
            size_uncompressed,
            size_compressed,
            crc32_compressed,
            compression_type,
            marker: LITE_MARKER,
        }
    }

    /// Serialize to [`LITE_FOOTER_SIZE`] bytes
    pub fn to_bytes(&self) -> FormatResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(LITE_FOOTER_SIZE));
        self.write_ne(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Read the trailer of a fragment on disk without reading the body
    ///
    /// Fails when the file is shorter than the trailer, the marker is wrong,
    /// or the declared stored size disagrees with the file length. All of
    /// these mean the fragment was never completed.
    pub fn read_from_path(path: impl AsRef<Path>) -> FormatResult<Self> {
        let mut file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        if len < LITE_FOOTER_SIZE as u64 {
            return Err(FormatError::CorruptFormat(format!(
                "{} is {len} bytes, too short for a dvpl trailer",
                path.as_ref().display()
            )));
        }
        file.seek(SeekFrom::End(-(LITE_FOOTER_SIZE as i64)))?;
        let mut bytes = [0u8; LITE_FOOTER_SIZE];
        file.read_exact(&mut bytes)?;
        let footer = Self::parse(&bytes)?;
        if u64::from(footer.size_compressed) + LITE_FOOTER_SIZE as u64 != len {
            return Err(FormatError::CorruptFormat(format!(
                "{} declares {} stored bytes but holds {}",
                path.as_ref().display(),
                footer.size_compressed,
                len - LITE_FOOTER_SIZE as u64
            )));
        }
        Ok(footer)
    }

    /// Produce a complete dvpl file body from original data
    pub fn pack(data: &[u8], compression: CompressionType) -> FormatResult<Vec<u8>> {
        let (stored, compression) = compress_if_smaller(data, compression)?;
        let footer = Self::new(
            data.len() as u32,
            stored.len() as u32,
            crc32(&stored),
            compression,
        );
        let mut out = stored;
        out.extend_from_slice(&footer.to_bytes()?);
        Ok(out)
    }
}

impl SuperpackFormat for LiteFooter {
    fn parse(data: &[u8]) -> FormatResult<Self> {
        if data.len() != LITE_FOOTER_SIZE {
            return Err(FormatError::CorruptFormat(format!(
                "dvpl trailer must be {LITE_FOOTER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let footer = Self::read_ne(&mut Cursor::new(data))?;
        if footer.marker != LITE_MARKER {
            return Err(FormatError::CorruptFormat(format!(
                "bad dvpl marker {}",
                hex::encode(footer.marker)
            )));
        }
        Ok(footer)
    }

    fn build(&self) -> FormatResult<Vec<u8>> {
        self.to_bytes()
    }
}

/// Verify and decompress a complete dvpl file held in memory
pub fn unpack_lite(bytes: &[u8]) -> FormatResult<Vec<u8>> {
    if bytes.len() < LITE_FOOTER_SIZE {
        return Err(FormatError::CorruptFormat(format!(
            "dvpl of {} bytes is too short",
            bytes.len()
        )));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - LITE_FOOTER_SIZE);
    let footer = LiteFooter::parse(trailer)?;
    if body.len() != footer.size_compressed as usize {
        return Err(FormatError::CorruptFormat(format!(
            "dvpl body is {} bytes, trailer declares {}",
            body.len(),
            footer.size_compressed
        )));
    }
    let actual = crc32(body);
    if actual != footer.crc32_compressed {
        return Err(FormatError::CrcMismatch {
            what: "dvpl body",
            expected: footer.crc32_compressed,
            actual,
        });
    }
    compression::decompress_to_vec(
        footer.compression_type,
        body,
        footer.size_uncompressed as usize,
    )
}

/// Compress `data`, falling back to storing it when compression does not help
pub fn compress_if_smaller(
    data: &[u8],
    compression: CompressionType,
) -> FormatResult<(Vec<u8>, CompressionType)> {
    if data.is_empty() || compression == CompressionType::None {
        return Ok((data.to_vec(), CompressionType::None));
    }
    let compressed = compression::compress(compression, data)?;
    if compressed.len() < data.len() {
        Ok((compressed, compression))
    } else {
        Ok((data.to_vec(), CompressionType::None))
    }
}
