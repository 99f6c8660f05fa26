//! Pack metadata: which pack owns each file and how packs depend on each other
//!
//! Layout (host-endian):
//!
//! ```text
//! "met2"
//! u32 numFiles
//! u32 packIndex[numFiles]
//! u32 numPacks
//! u32 packsSizeOriginal
//! u32 packsSizeCompressed
//! [LZ4 block] -> for each pack: name \0 dependencyList \0
//! ```
//!
//! `dependencyList` holds comma-separated pack indices (`"0,3"`, or empty).
//! At rest the list is kept as text; [`PackMetaData::pack_dependency_indexes`]
//! parses it on demand and reports malformed tokens.
//!
//! # Dependency closure
//!
//! For every pack the loader also memoizes its *children*: the transitive
//! closure of its dependencies. The closure is informational (ordering,
//! diagnostics, reverse lookups) and tolerates cycles; download gating uses
//! the direct dependency list only.

use crate::SuperpackFormat;
use crate::compression::{self, CompressionType};
use crate::error::{FormatError, FormatResult};
use std::collections::HashSet;

/// Magic at the start of a metadata blob
pub const META_MAGIC: [u8; 4] = *b"met2";

/// Name and raw dependency list of one pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackInfo {
    /// Pack name
    pub pack_name: String,
    /// Comma-separated dependency pack indices
    pub dependencies: String,
}

/// Lookup key for [`PackMetaData::pack_info`]
#[derive(Debug, Clone, Copy)]
pub enum PackRef<'a> {
    /// By pack index
    Index(u32),
    /// By pack name
    Name(&'a str),
}

/// Decoded pack metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackMetaData {
    pack_indexes: Vec<u32>,
    packs: Vec<PackInfo>,
    children: Vec<Vec<u32>>,
}

impl PackMetaData {
    /// Build metadata from a file-to-pack table and pack descriptions
    pub fn new(pack_indexes: Vec<u32>, packs: Vec<PackInfo>) -> FormatResult<Self> {
        validate_pack_indexes(&pack_indexes, packs.len())?;
        let children = collect_children(&packs);
        Ok(Self {
            pack_indexes,
            packs,
            children,
        })
    }

    /// Number of files described
    pub fn file_count(&self) -> usize {
        self.pack_indexes.len()
    }

    /// Number of packs described
    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    /// Pack owning a file
    pub fn pack_index_for_file(&self, file_index: u32) -> Option<u32> {
        self.pack_indexes.get(file_index as usize).copied()
    }

    /// Index of a pack by name
    pub fn pack_index(&self, pack_name: &str) -> FormatResult<u32> {
        self.packs
            .iter()
            .position(|pack| pack.pack_name == pack_name)
            .map(|index| index as u32)
            .ok_or_else(|| FormatError::PackNotFound(pack_name.to_string()))
    }

    /// All packs in index order
    pub fn packs(&self) -> &[PackInfo] {
        &self.packs
    }

    /// Pack description by index or name
    pub fn pack_info(&self, pack: PackRef<'_>) -> FormatResult<&PackInfo> {
        match pack {
            PackRef::Index(index) => self
                .packs
                .get(index as usize)
                .ok_or_else(|| FormatError::PackNotFound(format!("#{index}"))),
            PackRef::Name(name) => {
                let index = self.pack_index(name)?;
                Ok(&self.packs[index as usize])
            }
        }
    }

    /// File indices owned by a pack
    ///
    /// Linear in the number of files. Unknown pack names yield an empty list.
    pub fn file_indexes(&self, pack_name: &str) -> Vec<u32> {
        let Ok(pack_index) = self.pack_index(pack_name) else {
            return Vec::new();
        };
        self.pack_indexes
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == pack_index)
            .map(|(file_index, _)| file_index as u32)
            .collect()
    }

    /// Direct dependencies of a pack, as pack indices
    pub fn pack_dependency_indexes(&self, pack_name: &str) -> FormatResult<Vec<u32>> {
        let info = self.pack_info(PackRef::Name(pack_name))?;
        parse_dependency_list(info, self.packs.len())
    }

    /// Direct dependencies of a pack, as pack names
    pub fn pack_dependency_names(&self, pack_name: &str) -> FormatResult<Vec<String>> {
        Ok(self
            .pack_dependency_indexes(pack_name)?
            .into_iter()
            .map(|index| self.packs[index as usize].pack_name.clone())
            .collect())
    }

    /// Transitive dependencies of a pack (memoized at load time)
    pub fn children(&self, pack_index: u32) -> &[u32] {
        self.children
            .get(pack_index as usize)
            .map_or(&[], Vec::as_slice)
    }

    /// Whether `child` is a transitive dependency of `parent`
    pub fn is_child(&self, parent: u32, child: u32) -> bool {
        self.children(parent).contains(&child)
    }

    /// Packs that (transitively) depend on `pack_index`
    pub fn dependents(&self, pack_index: u32) -> Vec<u32> {
        (0..self.packs.len() as u32)
            .filter(|&candidate| self.is_child(candidate, pack_index))
            .collect()
    }

    /// Serialize to the on-wire metadata blob
    pub fn to_bytes(&self) -> FormatResult<Vec<u8>> {
        let mut strings = Vec::new();
        for pack in &self.packs {
            strings.extend_from_slice(pack.pack_name.as_bytes());
            strings.push(0);
            strings.extend_from_slice(pack.dependencies.as_bytes());
            strings.push(0);
        }
        let compressed = compression::compress(CompressionType::Lz4, &strings)?;

        let mut out = Vec::with_capacity(4 + 4 * (self.pack_indexes.len() + 4) + compressed.len());
        out.extend_from_slice(&META_MAGIC);
        out.extend_from_slice(&(self.pack_indexes.len() as u32).to_ne_bytes());
        for index in &self.pack_indexes {
            out.extend_from_slice(&index.to_ne_bytes());
        }
        out.extend_from_slice(&(self.packs.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(strings.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(compressed.len() as u32).to_ne_bytes());
        out.extend_from_slice(&compressed);
        Ok(out)
    }
}

impl SuperpackFormat for PackMetaData {
    fn parse(data: &[u8]) -> FormatResult<Self> {
        let mut reader = MetaReader { data, pos: 0 };

        let magic = reader.take(4)?;
        if magic != META_MAGIC {
            return Err(FormatError::MetaCorrupt(format!(
                "bad magic {} (expected {})",
                hex::encode(magic),
                hex::encode(META_MAGIC)
            )));
        }

        let num_files = reader.u32()? as usize;
        if num_files > data.len() / 4 {
            return Err(FormatError::MetaCorrupt(format!(
                "declares {num_files} files in a {}-byte blob",
                data.len()
            )));
        }
        let mut pack_indexes = Vec::with_capacity(num_files);
        for _ in 0..num_files {
            pack_indexes.push(reader.u32()?);
        }

        let num_packs = reader.u32()? as usize;
        let size_original = reader.u32()? as usize;
        let size_compressed = reader.u32()? as usize;
        let compressed = reader.take(size_compressed)?;
        if reader.pos != data.len() {
            return Err(FormatError::MetaCorrupt(format!(
                "{} trailing bytes after pack table",
                data.len() - reader.pos
            )));
        }

        let strings = compression::decompress_to_vec(CompressionType::Lz4, compressed, size_original)
            .map_err(|e| FormatError::MetaCorrupt(format!("pack table: {e}")))?;
        let strings = String::from_utf8(strings)
            .map_err(|e| FormatError::MetaCorrupt(format!("pack table is not UTF-8: {e}")))?;

        let mut fields = strings.split('\0');
        let mut packs = Vec::with_capacity(num_packs);
        for index in 0..num_packs {
            match (fields.next(), fields.next()) {
                (Some(name), Some(deps)) => packs.push(PackInfo {
                    pack_name: name.to_string(),
                    dependencies: deps.to_string(),
                }),
                _ => {
                    return Err(FormatError::MetaCorrupt(format!(
                        "pack table ends at pack {index} of {num_packs}"
                    )));
                }
            }
        }

        Self::new(pack_indexes, packs)
    }

    fn build(&self) -> FormatResult<Vec<u8>> {
        self.to_bytes()
    }
}

struct MetaReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MetaReader<'a> {
    fn take(&mut self, len: usize) -> FormatResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                FormatError::MetaCorrupt(format!(
                    "unexpected end of data at offset {} (need {len} bytes)",
                    self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> FormatResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

fn validate_pack_indexes(pack_indexes: &[u32], pack_count: usize) -> FormatResult<()> {
    if let Some((file, pack)) = pack_indexes
        .iter()
        .enumerate()
        .find(|(_, pack)| **pack as usize >= pack_count)
    {
        return Err(FormatError::MetaCorrupt(format!(
            "file {file} belongs to pack {pack} but only {pack_count} packs exist"
        )));
    }
    Ok(())
}

fn parse_dependency_list(info: &PackInfo, pack_count: usize) -> FormatResult<Vec<u32>> {
    info.dependencies
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<u32>()
                .ok()
                .filter(|index| (*index as usize) < pack_count)
                .ok_or_else(|| FormatError::BadDependencyIndex {
                    pack: info.pack_name.clone(),
                    token: token.to_string(),
                })
        })
        .collect()
}

/// Depth-first transitive closure of every pack's dependencies
///
/// Malformed dependency lists contribute nothing here; they are reported when
/// queried through [`PackMetaData::pack_dependency_indexes`].
fn collect_children(packs: &[PackInfo]) -> Vec<Vec<u32>> {
    let direct: Vec<Vec<u32>> = packs
        .iter()
        .map(|info| parse_dependency_list(info, packs.len()).unwrap_or_default())
        .collect();

    (0..packs.len())
        .map(|root| {
            let mut seen = HashSet::new();
            let mut order = Vec::new();
            let mut stack: Vec<u32> = direct[root].iter().rev().copied().collect();
            while let Some(pack) = stack.pop() {
                if pack as usize == root || !seen.insert(pack) {
                    continue;
                }
                order.push(pack);
                stack.extend(direct[pack as usize].iter().rev().copied());
            }
            order
        })
        .collect()
}
