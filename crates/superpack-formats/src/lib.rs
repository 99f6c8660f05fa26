//! Binary formats of the superpack content archive
//!
#![allow(clippy::cast_possible_truncation)] // Intentional for binary format parsing
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::uninlined_format_args)] // Backwards compatibility
#![allow(clippy::doc_markdown)] // Format terms don't need backticks
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred
#![allow(clippy::redundant_closure_for_method_calls)] // Iterator chains
#![allow(clippy::return_self_not_must_use)] // Builder patterns
#![allow(clippy::use_self)] // Type clarity
//! A superpack is one large archive holding every downloadable file, split
//! into logical packs. Everything needed to navigate it is appended at the
//! end so a client can bootstrap with ranged reads from the tail:
//!
//! ```text
//! [file data...][FileTableEntry[numFiles]][LZ4 names][metadata][footer]
//! ```
//!
//! # Modules
//!
//! - [`footer`]: fixed 36-byte trailing block, CRC-guarded
//! - [`file_table`]: per-file directory plus the compressed name blob
//! - [`pack_meta`]: file-to-pack ownership and the pack dependency graph
//! - [`lite`]: the 20-byte trailer on locally stored fragments (`.dvpl`)
//! - [`compression`]: None / LZ4 / LZ4HC / Deflate codecs
//! - [`crc`]: CRC32 helpers
//! - [`builder`]: assembles complete archives
//!
//! # Byte order
//!
//! All integers are host-endian. This matches the deployed archives and is a
//! known constraint: the format is only portable between hosts of the same
//! endianness.

#![warn(missing_docs)]

pub mod builder;
pub mod compression;
pub mod crc;
pub mod error;
pub mod file_table;
pub mod footer;
pub mod lite;
pub mod pack_meta;

pub use builder::{BuiltSuperpack, SuperpackBuilder};
pub use compression::{CompressionType, compress, decompress, decompress_to_vec};
pub use crc::{Crc32Hasher, crc32, crc32_file, verify_crc32};
pub use error::{FormatError, FormatResult};
pub use file_table::{FILE_TABLE_ENTRY_SIZE, FileNames, FileTable, FileTableEntry};
pub use footer::{FOOTER_SIZE, FooterInfo, PACK_ARCHIVE_MARKER, SuperpackFooter};
pub use lite::{DVPL_EXTENSION, LITE_FOOTER_SIZE, LiteFooter, unpack_lite};
pub use pack_meta::{PackInfo, PackMetaData, PackRef};

/// Common trait for structures with a symmetric binary form
pub trait SuperpackFormat: Sized {
    /// Parse from bytes
    fn parse(data: &[u8]) -> FormatResult<Self>;

    /// Build to bytes
    fn build(&self) -> FormatResult<Vec<u8>>;

    /// Verify round-trip correctness
    fn verify_round_trip(data: &[u8]) -> FormatResult<()> {
        let parsed = Self::parse(data)?;
        let rebuilt = parsed.build()?;
        if data != rebuilt.as_slice() {
            return Err(FormatError::CorruptFormat(
                "round-trip verification failed".to_string(),
            ));
        }
        Ok(())
    }
}
