//! Superpack builder
//!
//! Assembles a complete archive from packs and files:
//!
//! ```text
//! [file data...][metadata block][file table block][footer]
//! ```
//!
//! Each file is compressed with the builder's codec unless that does not make
//! it smaller, in which case it is stored.

use crate::SuperpackFormat;
use crate::compression::CompressionType;
use crate::crc::crc32;
use crate::error::{FormatError, FormatResult};
use crate::file_table::{FileTableEntry, encode_file_table};
use crate::footer::{FooterInfo, PACK_ARCHIVE_MARKER, SuperpackFooter};
use crate::lite::compress_if_smaller;
use crate::pack_meta::{PackInfo, PackMetaData};

#[derive(Debug, Clone)]
struct PendingPack {
    name: String,
    dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
struct PendingFile {
    pack: String,
    name: String,
    data: Vec<u8>,
}

/// Builder for superpack archives
#[derive(Debug, Clone, Default)]
pub struct SuperpackBuilder {
    compression: CompressionType,
    packs: Vec<PendingPack>,
    files: Vec<PendingFile>,
}

/// Output of [`SuperpackBuilder::build`]
#[derive(Debug, Clone)]
pub struct BuiltSuperpack {
    /// Complete archive bytes
    pub bytes: Vec<u8>,
    /// Footer written at the end of `bytes`
    pub footer: SuperpackFooter,
    /// File table in archive order
    pub entries: Vec<FileTableEntry>,
    /// Relative file names in archive order
    pub names: Vec<String>,
    /// Metadata written into the archive
    pub meta: PackMetaData,
}

impl SuperpackBuilder {
    /// Create an empty builder storing files uncompressed
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec applied to file data
    #[must_use]
    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Declare a pack; declaration order defines pack indices
    pub fn pack(&mut self, name: &str, dependencies: &[&str]) -> &mut Self {
        self.packs.push(PendingPack {
            name: name.to_string(),
            dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
        });
        self
    }

    /// Add a file owned by a declared pack
    pub fn add_file(&mut self, pack: &str, name: &str, data: impl Into<Vec<u8>>) -> &mut Self {
        self.files.push(PendingFile {
            pack: pack.to_string(),
            name: name.to_string(),
            data: data.into(),
        });
        self
    }

    /// Number of files added so far
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    fn pack_index(&self, name: &str) -> FormatResult<u32> {
        self.packs
            .iter()
            .position(|pack| pack.name == name)
            .map(|index| index as u32)
            .ok_or_else(|| FormatError::PackNotFound(name.to_string()))
    }

    fn build_meta(&self) -> FormatResult<PackMetaData> {
        let mut infos = Vec::with_capacity(self.packs.len());
        for pack in &self.packs {
            let indices = pack
                .dependencies
                .iter()
                .map(|dep| self.pack_index(dep).map(|index| index.to_string()))
                .collect::<FormatResult<Vec<_>>>()?;
            infos.push(PackInfo {
                pack_name: pack.name.clone(),
                dependencies: indices.join(","),
            });
        }
        let pack_indexes = self
            .files
            .iter()
            .map(|file| self.pack_index(&file.pack))
            .collect::<FormatResult<Vec<_>>>()?;
        PackMetaData::new(pack_indexes, infos)
    }

    /// Assemble the archive
    pub fn build(&self) -> FormatResult<BuiltSuperpack> {
        let meta = self.build_meta()?;

        let mut bytes = Vec::new();
        let mut entries = Vec::with_capacity(self.files.len());
        for (index, file) in self.files.iter().enumerate() {
            let (stored, compression) = compress_if_smaller(&file.data, self.compression)?;
            entries.push(FileTableEntry {
                start_position: bytes.len() as u64,
                compressed_size: stored.len() as u32,
                original_size: file.data.len() as u32,
                compressed_crc32: crc32(&stored),
                original_crc32: crc32(&file.data),
                compression_type: compression,
                meta_index: meta.pack_index_for_file(index as u32).unwrap_or(0),
            });
            bytes.extend_from_slice(&stored);
        }

        let meta_bytes = meta.build()?;
        bytes.extend_from_slice(&meta_bytes);

        let names: Vec<String> = self.files.iter().map(|file| file.name.clone()).collect();
        let table = encode_file_table(&entries, &names)?;
        bytes.extend_from_slice(&table.bytes);

        let footer = SuperpackFooter::seal(
            FooterInfo {
                num_files: entries.len() as u32,
                names_size_compressed: table.names_size_compressed,
                names_size_original: table.names_size_original,
                files_table_size: table.bytes.len() as u32,
                files_table_crc32: crc32(&table.bytes),
                pack_archive_marker: PACK_ARCHIVE_MARKER,
            },
            crc32(&meta_bytes),
            meta_bytes.len() as u32,
        )?;
        bytes.extend_from_slice(&footer.build()?);

        Ok(BuiltSuperpack {
            bytes,
            footer,
            entries,
            names,
            meta,
        })
    }
}

impl BuiltSuperpack {
    /// File table block as stored in the archive
    pub fn file_table_bytes(&self) -> &[u8] {
        let total = self.bytes.len() as u64;
        let start = self.footer.files_table_offset(total).unwrap_or(total) as usize;
        let end = start + self.footer.info.files_table_size as usize;
        &self.bytes[start..end.min(self.bytes.len())]
    }

    /// Metadata block as stored in the archive
    pub fn meta_bytes(&self) -> &[u8] {
        let total = self.bytes.len() as u64;
        let start = self.footer.meta_data_offset(total).unwrap_or(total) as usize;
        let end = start + self.footer.meta_data_size as usize;
        &self.bytes[start..end.min(self.bytes.len())]
    }

    /// Stored bytes of one file
    pub fn stored_file(&self, index: usize) -> Option<&[u8]> {
        let entry = self.entries.get(index)?;
        let range = entry.byte_range();
        self.bytes.get(range.start as usize..range.end as usize)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::compression::decompress_to_vec;
    use crate::file_table::FileTable;
    use crate::footer::FOOTER_SIZE;

    fn sample() -> BuiltSuperpack {
        let mut builder = SuperpackBuilder::new().with_compression(CompressionType::Lz4Hc);
        builder
            .pack("base", &[])
            .pack("level1", &["base"])
            .add_file("base", "data/config.yaml", b"key: value\n".repeat(30))
            .add_file("level1", "maps/level1.map", vec![0x5a; 4096])
            .add_file("base", "empty.txt", Vec::new());
        builder.build().expect("Operation should succeed")
    }

    #[test]
    fn test_build_and_read_back() {
        let built = sample();
        let footer = SuperpackFooter::from_archive_tail(&built.bytes).expect("Operation should succeed");
        assert_eq!(footer, built.footer);
        footer.validate_sizes(built.bytes.len() as u64).expect("Operation should succeed");

        let table = FileTable::extract(&footer, built.file_table_bytes()).expect("Operation should succeed");
        assert_eq!(table.len(), 3);
        assert_eq!(table.name(1), Some("maps/level1.map"));

        let meta = PackMetaData::parse(built.meta_bytes()).expect("Operation should succeed");
        assert_eq!(meta.file_indexes("base"), vec![0, 2]);
        assert_eq!(meta.pack_dependency_names("level1").expect("Operation should succeed"), vec!["base"]);
        assert_eq!(crc32(built.meta_bytes()), footer.meta_data_crc32);

        for (index, entry) in table.entries.iter().enumerate() {
            let stored = built.stored_file(index).expect("Operation should succeed");
            assert_eq!(crc32(stored), entry.compressed_crc32);
            let original = decompress_to_vec(entry.compression_type, stored, entry.original_size as usize)
                .expect("Operation should succeed");
            assert_eq!(crc32(&original), entry.original_crc32);
        }
    }

    #[test]
    fn test_empty_file_is_stored() {
        let built = sample();
        assert_eq!(built.entries[2].compression_type, CompressionType::None);
        assert_eq!(built.entries[2].compressed_size, 0);
        assert_eq!(built.entries[1].compression_type, CompressionType::Lz4Hc);
        assert_eq!(built.entries[1].meta_index, 1);
    }

    #[test]
    fn test_unknown_pack_rejected() {
        let mut builder = SuperpackBuilder::new();
        builder.pack("a", &["missing"]);
        assert!(matches!(builder.build(), Err(FormatError::PackNotFound(_))));

        let mut builder = SuperpackBuilder::new();
        builder.add_file("nowhere", "x", vec![1]);
        assert!(matches!(builder.build(), Err(FormatError::PackNotFound(_))));
    }

    #[test]
    fn test_empty_archive() {
        let built = SuperpackBuilder::new().build().expect("Operation should succeed");
        assert_eq!(built.footer.info.num_files, 0);
        assert_eq!(built.footer.info.files_table_size, 0);
        assert!(built.bytes.len() >= FOOTER_SIZE);
    }
}
