//! Superpack footer block
//!
//! The footer is the fixed-size record at the absolute end of a superpack. A
//! client fetches it first (a ranged request for the last [`FOOTER_SIZE`]
//! bytes) and derives every other offset backwards from the total archive
//! size.
//!
//! Layout (36 bytes, host-endian):
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 4    | Number of files |
//! | 0x04   | 4    | Compressed size of the names block |
//! | 0x08   | 4    | Original size of the names block |
//! | 0x0C   | 4    | File table block size |
//! | 0x10   | 4    | File table block CRC32 |
//! | 0x14   | 4    | Archive marker `DVPK` |
//! | 0x18   | 4    | CRC32 of bytes 0x00..0x18 |
//! | 0x1C   | 4    | Metadata CRC32 |
//! | 0x20   | 4    | Metadata size |
//!
//! Integers are written in host byte order. The archive tools and every
//! deployed client share one endianness, so no conversion is performed; a
//! big-endian reader would have to byte-swap these fields itself.

use crate::SuperpackFormat;
use crate::crc::crc32;
use crate::error::{FormatError, FormatResult};
use binrw::{BinRead, BinWrite};
use std::io::Cursor;

/// Marker stored in every superpack footer
pub const PACK_ARCHIVE_MARKER: [u8; 4] = *b"DVPK";

/// Size of the CRC-guarded info sub-block
pub const FOOTER_INFO_SIZE: usize = 24;

/// Total size of the footer block
pub const FOOTER_SIZE: usize = FOOTER_INFO_SIZE + 12;

/// Info sub-block, guarded by [`SuperpackFooter::info_crc32`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct FooterInfo {
    /// Number of files in the archive
    pub num_files: u32,
    /// Size of the LZ4 names block inside the file table
    pub names_size_compressed: u32,
    /// Size of the decompressed NUL-delimited names
    pub names_size_original: u32,
    /// Size of the whole file table block
    pub files_table_size: u32,
    /// CRC32 of the whole file table block
    pub files_table_crc32: u32,
    /// Must equal [`PACK_ARCHIVE_MARKER`]
    pub pack_archive_marker: [u8; 4],
}

impl FooterInfo {
    fn to_bytes(self) -> FormatResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(FOOTER_INFO_SIZE));
        self.write_ne(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

/// Fixed-size trailing block of a superpack
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct SuperpackFooter {
    /// CRC-guarded description of the file table
    pub info: FooterInfo,
    /// CRC32 of the serialized info block
    pub info_crc32: u32,
    /// CRC32 of the metadata block
    pub meta_data_crc32: u32,
    /// Size of the metadata block
    pub meta_data_size: u32,
}

impl SuperpackFooter {
    /// Build a footer and compute its info checksum
    pub fn seal(info: FooterInfo, meta_data_crc32: u32, meta_data_size: u32) -> FormatResult<Self> {
        let info_crc32 = crc32(&info.to_bytes()?);
        Ok(Self {
            info,
            info_crc32,
            meta_data_crc32,
            meta_data_size,
        })
    }

    /// Decode the footer from the last [`FOOTER_SIZE`] bytes of `data`
    ///
    /// Useful when a whole archive (or a tail slice of one) is in memory.
    pub fn from_archive_tail(data: &[u8]) -> FormatResult<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(FormatError::CorruptFormat(format!(
                "archive of {} bytes is smaller than the {FOOTER_SIZE}-byte footer",
                data.len()
            )));
        }
        Self::parse(&data[data.len() - FOOTER_SIZE..])
    }

    /// Check the marker
    pub fn validate_marker(&self) -> FormatResult<()> {
        if self.info.pack_archive_marker != PACK_ARCHIVE_MARKER {
            return Err(FormatError::CorruptFormat(format!(
                "bad pack archive marker {} (expected {})",
                hex::encode(self.info.pack_archive_marker),
                hex::encode(PACK_ARCHIVE_MARKER)
            )));
        }
        Ok(())
    }

    /// Recompute the info checksum and compare it with the stored one
    pub fn verify_info_crc(&self) -> FormatResult<()> {
        let actual = crc32(&self.info.to_bytes()?);
        if actual != self.info_crc32 {
            return Err(FormatError::CrcMismatch {
                what: "footer info",
                expected: self.info_crc32,
                actual,
            });
        }
        Ok(())
    }

    /// Check that the declared blocks fit inside an archive of `total_size` bytes
    pub fn validate_sizes(&self, total_size: u64) -> FormatResult<()> {
        let needed = self.trailing_size();
        if needed > total_size {
            return Err(FormatError::CorruptFormat(format!(
                "footer declares {needed} trailing bytes but archive is {total_size} bytes"
            )));
        }
        Ok(())
    }

    /// Bytes occupied by file table, metadata and footer together
    pub fn trailing_size(&self) -> u64 {
        u64::from(self.info.files_table_size) + u64::from(self.meta_data_size) + FOOTER_SIZE as u64
    }

    /// Absolute offset of the file table block
    pub fn files_table_offset(&self, total_size: u64) -> FormatResult<u64> {
        total_size
            .checked_sub(FOOTER_SIZE as u64 + u64::from(self.info.files_table_size))
            .ok_or_else(|| {
                FormatError::CorruptFormat(format!(
                    "file table of {} bytes does not fit archive of {total_size} bytes",
                    self.info.files_table_size
                ))
            })
    }

    /// Absolute offset of the metadata block
    pub fn meta_data_offset(&self, total_size: u64) -> FormatResult<u64> {
        total_size.checked_sub(self.trailing_size()).ok_or_else(|| {
            FormatError::CorruptFormat(format!(
                "metadata of {} bytes does not fit archive of {total_size} bytes",
                self.meta_data_size
            ))
        })
    }

    /// Serialize to exactly [`FOOTER_SIZE`] bytes
    pub fn to_bytes(&self) -> FormatResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::with_capacity(FOOTER_SIZE));
        self.write_ne(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

impl SuperpackFormat for SuperpackFooter {
    /// Parse exactly [`FOOTER_SIZE`] bytes, rejecting a bad marker or checksum
    fn parse(data: &[u8]) -> FormatResult<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(FormatError::CorruptFormat(format!(
                "footer must be {FOOTER_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let footer = Self::read_ne(&mut Cursor::new(data))?;
        footer.validate_marker()?;
        footer.verify_info_crc()?;
        Ok(footer)
    }

    fn build(&self) -> FormatResult<Vec<u8>> {
        self.to_bytes()
    }
}
