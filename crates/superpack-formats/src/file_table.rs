//! File table block and file names
//!
//! The file table sits immediately before the metadata block. On the wire it
//! is:
//!
//! ```text
//! [FileTableEntry; numFiles][LZ4 names block][u32 CRC32 of names block]
//! ```
//!
//! The whole block is CRC-checked against the footer before anything in it is
//! trusted; the names block carries a second CRC of its compressed bytes.
//! Decompressed names are NUL-terminated relative paths whose order matches
//! the entry array one to one.

use crate::compression::{self, CompressionType};
use crate::crc::crc32;
use crate::error::{FormatError, FormatResult};
use crate::footer::SuperpackFooter;
use binrw::{BinRead, BinWrite};
use std::collections::HashMap;
use std::io::Cursor;

/// Size of one serialized [`FileTableEntry`]
pub const FILE_TABLE_ENTRY_SIZE: usize = 32;

/// Directory record for one physical file in the archive
///
/// | Offset | Size | Field |
/// |--------|------|-------|
/// | 0x00   | 8    | Start position in archive |
/// | 0x08   | 4    | Compressed size |
/// | 0x0C   | 4    | Original size |
/// | 0x10   | 4    | Compressed CRC32 |
/// | 0x14   | 4    | Original CRC32 |
/// | 0x18   | 4    | Compression type |
/// | 0x1C   | 4    | Owning pack index |
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
pub struct FileTableEntry {
    /// Byte offset of the stored data within the archive
    pub start_position: u64,
    /// Stored (possibly compressed) size
    pub compressed_size: u32,
    /// Size after decompression
    pub original_size: u32,
    /// CRC32 of the stored bytes
    pub compressed_crc32: u32,
    /// CRC32 of the decompressed bytes
    pub original_crc32: u32,
    /// Codec of the stored bytes
    pub compression_type: CompressionType,
    /// Index of the pack owning this file
    pub meta_index: u32,
}

impl FileTableEntry {
    /// Absolute byte range `[start, end)` of the stored data
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.start_position..self.start_position + u64::from(self.compressed_size)
    }
}

/// Decompressed NUL-delimited name blob with per-file start offsets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileNames {
    blob: String,
    starts: Vec<usize>,
}

impl FileNames {
    /// Split a decompressed names blob
    ///
    /// Every name, including the last, must be NUL-terminated.
    pub fn from_blob(blob: Vec<u8>) -> FormatResult<Self> {
        let blob = String::from_utf8(blob)
            .map_err(|e| FormatError::CorruptFormat(format!("file names are not UTF-8: {e}")))?;
        if !blob.is_empty() && !blob.ends_with('\0') {
            return Err(FormatError::CorruptFormat(
                "file names block is not NUL-terminated".to_string(),
            ));
        }

        let mut starts = Vec::new();
        let mut start = 0;
        for (index, byte) in blob.bytes().enumerate() {
            if byte == 0 {
                starts.push(start);
                start = index + 1;
            }
        }
        Ok(Self { blob, starts })
    }

    /// Join names into a blob, each followed by a NUL byte
    pub fn join<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
        let mut blob = Vec::new();
        for name in names {
            blob.extend_from_slice(name.as_ref().as_bytes());
            blob.push(0);
        }
        blob
    }

    /// Number of names
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    /// Whether there are no names
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Name of the file at `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        let start = *self.starts.get(index)?;
        let end = self.blob[start..].find('\0').map_or(self.blob.len(), |n| start + n);
        Some(&self.blob[start..end])
    }

    /// Iterate names in file order
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        (0..self.len()).filter_map(|index| self.get(index))
    }
}

/// Decoded file table: entries plus their names
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTable {
    /// Entries in archive order
    pub entries: Vec<FileTableEntry>,
    /// Names aligned with `entries`
    pub names: FileNames,
}

impl FileTable {
    /// Number of files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for a file index
    pub fn entry(&self, index: usize) -> Option<&FileTableEntry> {
        self.entries.get(index)
    }

    /// Relative path for a file index
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index)
    }

    /// Map from relative path to file index
    pub fn name_index(&self) -> HashMap<&str, usize> {
        self.names.iter().enumerate().map(|(index, name)| (name, index)).collect()
    }

    /// Decode a file table block fetched from the archive
    ///
    /// The CRC of `table_bytes` is checked against the footer before parsing,
    /// then the names block is checked and decompressed into a buffer of the
    /// declared original size.
    pub fn extract(footer: &SuperpackFooter, table_bytes: &[u8]) -> FormatResult<Self> {
        let info = &footer.info;
        if table_bytes.len() != info.files_table_size as usize {
            return Err(FormatError::CorruptFormat(format!(
                "file table is {} bytes, footer declares {}",
                table_bytes.len(),
                info.files_table_size
            )));
        }

        let actual = crc32(table_bytes);
        if actual != info.files_table_crc32 {
            return Err(FormatError::CrcMismatch {
                what: "file table",
                expected: info.files_table_crc32,
                actual,
            });
        }

        if info.num_files == 0 {
            return Ok(Self::default());
        }

        let entries_size = info.num_files as usize * FILE_TABLE_ENTRY_SIZE;
        let names_end = entries_size + info.names_size_compressed as usize;
        if names_end + 4 != table_bytes.len() {
            return Err(FormatError::CorruptFormat(format!(
                "file table of {} bytes cannot hold {} entries and {} bytes of names",
                table_bytes.len(),
                info.num_files,
                info.names_size_compressed
            )));
        }

        let mut cursor = Cursor::new(&table_bytes[..entries_size]);
        let mut entries = Vec::with_capacity(info.num_files as usize);
        for _ in 0..info.num_files {
            entries.push(FileTableEntry::read_ne(&mut cursor)?);
        }

        let compressed_names = &table_bytes[entries_size..names_end];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&table_bytes[names_end..]);
        let names_crc = u32::from_ne_bytes(crc_bytes);
        let actual = crc32(compressed_names);
        if actual != names_crc {
            return Err(FormatError::CrcMismatch {
                what: "file names",
                expected: names_crc,
                actual,
            });
        }

        let blob = compression::decompress_to_vec(
            CompressionType::Lz4Hc,
            compressed_names,
            info.names_size_original as usize,
        )?;
        let names = FileNames::from_blob(blob)?;

        if names.len() != entries.len() {
            return Err(FormatError::NameCountMismatch {
                names: names.len(),
                entries: entries.len(),
            });
        }

        Ok(Self { entries, names })
    }
}

/// Serialized file table block plus the sizes the footer must record
#[derive(Debug, Clone)]
pub struct EncodedFileTable {
    /// Complete block bytes
    pub bytes: Vec<u8>,
    /// Compressed names size
    pub names_size_compressed: u32,
    /// Original names size
    pub names_size_original: u32,
}

/// Encode entries and names into a file table block
pub fn encode_file_table<S: AsRef<str>>(
    entries: &[FileTableEntry],
    names: &[S],
) -> FormatResult<EncodedFileTable> {
    if entries.len() != names.len() {
        return Err(FormatError::NameCountMismatch {
            names: names.len(),
            entries: entries.len(),
        });
    }
    if entries.is_empty() {
        return Ok(EncodedFileTable {
            bytes: Vec::new(),
            names_size_compressed: 0,
            names_size_original: 0,
        });
    }

    let blob = FileNames::join(names);
    let compressed = compression::compress(CompressionType::Lz4Hc, &blob)?;

    let mut cursor = Cursor::new(Vec::with_capacity(
        entries.len() * FILE_TABLE_ENTRY_SIZE + compressed.len() + 4,
    ));
    for entry in entries {
        entry.write_ne(&mut cursor)?;
    }
    let mut bytes = cursor.into_inner();
    bytes.extend_from_slice(&compressed);
    bytes.extend_from_slice(&crc32(&compressed).to_ne_bytes());

    Ok(EncodedFileTable {
        bytes,
        names_size_compressed: compressed.len() as u32,
        names_size_original: blob.len() as u32,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::footer::{FooterInfo, PACK_ARCHIVE_MARKER};

    fn entry(start: u64, size: u32, pack: u32) -> FileTableEntry {
        FileTableEntry {
            start_position: start,
            compressed_size: size,
            original_size: size * 2,
            compressed_crc32: 0x1000 + size,
            original_crc32: 0x2000 + size,
            compression_type: CompressionType::Lz4,
            meta_index: pack,
        }
    }

    fn footer_for(encoded: &EncodedFileTable, num_files: u32) -> SuperpackFooter {
        SuperpackFooter::seal(
            FooterInfo {
                num_files,
                names_size_compressed: encoded.names_size_compressed,
                names_size_original: encoded.names_size_original,
                files_table_size: encoded.bytes.len() as u32,
                files_table_crc32: crc32(&encoded.bytes),
                pack_archive_marker: PACK_ARCHIVE_MARKER,
            },
            0,
            0,
        )
        .expect("Operation should succeed")
    }

    #[test]
    fn test_entry_size() {
        let mut cursor = Cursor::new(Vec::new());
        entry(0, 10, 0).write_ne(&mut cursor).expect("Operation should succeed");
        assert_eq!(cursor.into_inner().len(), FILE_TABLE_ENTRY_SIZE);
    }

    #[test]
    fn test_extract_encoded_table() {
        let entries = vec![entry(0, 10, 0), entry(10, 20, 1), entry(30, 5, 1)];
        let names = ["data/a.txt", "gfx/b.png", "gfx/sub/c.bin"];
        let encoded = encode_file_table(&entries, &names).expect("Operation should succeed");
        let footer = footer_for(&encoded, 3);

        let table = FileTable::extract(&footer, &encoded.bytes).expect("Operation should succeed");
        assert_eq!(table.entries, entries);
        assert_eq!(table.name(0), Some("data/a.txt"));
        assert_eq!(table.name(2), Some("gfx/sub/c.bin"));
        assert_eq!(table.name(3), None);
        assert_eq!(table.name_index().get("gfx/b.png"), Some(&1));
        assert_eq!(table.entry(1).map(FileTableEntry::byte_range), Some(10..30));
    }

    #[test]
    fn test_crc_checked_before_parse() {
        let entries = vec![entry(0, 10, 0)];
        let encoded = encode_file_table(&entries, &["a"]).expect("Operation should succeed");
        let footer = footer_for(&encoded, 1);
        let mut bytes = encoded.bytes.clone();
        bytes[0] ^= 0xff;
        let err = FileTable::extract(&footer, &bytes).expect_err("Corrupt table must fail");
        assert!(matches!(
            err,
            FormatError::CrcMismatch {
                what: "file table",
                ..
            }
        ));
    }

    #[test]
    fn test_name_count_must_match() {
        let entries = vec![entry(0, 10, 0), entry(10, 10, 0)];
        assert!(matches!(
            encode_file_table(&entries, &["only-one"]),
            Err(FormatError::NameCountMismatch { .. })
        ));

        // Encode two names but declare three entries' worth of table
        let encoded = encode_file_table(&entries, &["a", "b"]).expect("Operation should succeed");
        let footer = footer_for(&encoded, 3);
        assert!(FileTable::extract(&footer, &encoded.bytes).is_err());
    }

    #[test]
    fn test_empty_table() {
        let encoded =
            encode_file_table::<&str>(&[], &[]).expect("Operation should succeed");
        assert!(encoded.bytes.is_empty());
        let footer = footer_for(&encoded, 0);
        let table = FileTable::extract(&footer, &[]).expect("Operation should succeed");
        assert!(table.is_empty());
    }

    #[test]
    fn test_file_names_require_terminator() {
        assert!(FileNames::from_blob(b"a\0b".to_vec()).is_err());
        let names = FileNames::from_blob(b"a\0\0c\0".to_vec()).expect("Operation should succeed");
        assert_eq!(names.iter().collect::<Vec<_>>(), vec!["a", "", "c"]);
    }
}
