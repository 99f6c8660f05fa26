//! Local copies of the superpack's trailing blocks
//!
//! | File | Contents | Trusted when |
//! |------|----------|--------------|
//! | `local_copy_server_footer.footer` | footer | marker and info CRC valid |
//! | `local_copy_server_file_table.block` | file table block | CRC equals `filesTableCrc32` |
//! | `local_copy_server_meta.meta` | metadata blob | CRC equals `metaDataCrc32` |
//!
//! Each piece is validated on its own; a stale one is fetched again without
//! touching the others.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use superpack_formats::{DVPL_EXTENSION, SuperpackFooter, SuperpackFormat, crc32};
use tracing::debug;

use crate::error::{DlcError, DlcResult};

pub const FOOTER_CACHE_FILE: &str = "local_copy_server_footer.footer";
pub const FILE_TABLE_CACHE_FILE: &str = "local_copy_server_file_table.block";
pub const META_CACHE_FILE: &str = "local_copy_server_meta.meta";

#[derive(Debug, Clone)]
pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn footer_path(&self) -> PathBuf {
        self.dir.join(FOOTER_CACHE_FILE)
    }

    pub fn file_table_path(&self) -> PathBuf {
        self.dir.join(FILE_TABLE_CACHE_FILE)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_CACHE_FILE)
    }

    /// Cached footer, if present and intact
    pub fn load_footer(&self) -> Option<SuperpackFooter> {
        let bytes = read_optional(&self.footer_path())?;
        match SuperpackFooter::parse(&bytes) {
            Ok(footer) => Some(footer),
            Err(e) => {
                debug!(error = %e, "Ignoring invalid footer cache");
                None
            }
        }
    }

    pub fn store_footer(&self, footer: &SuperpackFooter) -> DlcResult<()> {
        write(&self.footer_path(), &footer.to_bytes()?)
    }

    /// Cached file table block, if it matches `footer`
    pub fn load_file_table(&self, footer: &SuperpackFooter) -> Option<Vec<u8>> {
        let bytes = read_optional(&self.file_table_path())?;
        matches_block(
            "file table",
            &bytes,
            footer.info.files_table_size,
            footer.info.files_table_crc32,
        )
        .then_some(bytes)
    }

    pub fn store_file_table(&self, bytes: &[u8]) -> DlcResult<()> {
        write(&self.file_table_path(), bytes)
    }

    /// Cached metadata blob, if it matches `footer`
    pub fn load_meta(&self, footer: &SuperpackFooter) -> Option<Vec<u8>> {
        let bytes = read_optional(&self.meta_path())?;
        matches_block(
            "metadata",
            &bytes,
            footer.meta_data_size,
            footer.meta_data_crc32,
        )
        .then_some(bytes)
    }

    pub fn store_meta(&self, bytes: &[u8]) -> DlcResult<()> {
        write(&self.meta_path(), bytes)
    }

    pub fn remove_meta(&self) -> DlcResult<()> {
        remove_if_exists(&self.meta_path())
    }

    /// Local fragment path of a superpack file
    pub fn fragment_path(&self, name: &str) -> DlcResult<PathBuf> {
        fragment_path(&self.dir, name)
    }
}

/// `<dir>/<name>.dvpl`, refusing names that leave `dir`
pub fn fragment_path(dir: &Path, name: &str) -> DlcResult<PathBuf> {
    let relative = Path::new(name);
    let safe = !name.is_empty()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        return Err(DlcError::UnsafeFileName(name.to_string()));
    }
    Ok(dir.join(format!("{name}.{DVPL_EXTENSION}")))
}

/// Relative superpack name of a fragment under `dir`
pub fn fragment_name(dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(dir).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    let joined = parts.join("/");
    joined
        .strip_suffix(&format!(".{DVPL_EXTENSION}"))
        .map(str::to_string)
}

fn matches_block(what: &str, bytes: &[u8], size: u32, expected_crc: u32) -> bool {
    if bytes.len() != size as usize {
        debug!(what, cached = bytes.len(), expected = size, "Cached block has the wrong size");
        return false;
    }
    let actual = crc32(bytes);
    if actual != expected_crc {
        debug!(
            what,
            expected = format_args!("0x{expected_crc:08x}"),
            actual = format_args!("0x{actual:08x}"),
            "Cached block is stale"
        );
        return false;
    }
    true
}

fn read_optional(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cannot read cache file");
            None
        }
    }
}

fn write(path: &Path, bytes: &[u8]) -> DlcResult<()> {
    fs::write(path, bytes).map_err(|e| DlcError::io(path, e))
}

pub(crate) fn remove_if_exists(path: &Path) -> DlcResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DlcError::io(path, e)),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use superpack_formats::{CompressionType, SuperpackBuilder};
    use tempfile::TempDir;

    fn archive() -> superpack_formats::BuiltSuperpack {
        let mut builder = SuperpackBuilder::new().with_compression(CompressionType::Lz4);
        builder
            .pack("base", &[])
            .add_file("base", "data/a.txt", b"alpha".repeat(40));
        builder.build().expect("Operation should succeed")
    }

    #[test]
    fn test_blocks_validated_against_footer() {
        let dir = TempDir::new().expect("Operation should succeed");
        let cache = LocalCache::new(dir.path());
        let built = archive();

        assert!(cache.load_footer().is_none());
        cache.store_footer(&built.footer).expect("Operation should succeed");
        assert_eq!(cache.load_footer(), Some(built.footer));

        cache
            .store_file_table(built.file_table_bytes())
            .expect("Operation should succeed");
        assert_eq!(
            cache.load_file_table(&built.footer).as_deref(),
            Some(built.file_table_bytes())
        );

        let mut stale = built.meta_bytes().to_vec();
        stale[6] ^= 0x01;
        cache.store_meta(&stale).expect("Operation should succeed");
        assert!(cache.load_meta(&built.footer).is_none());

        cache.remove_meta().expect("Operation should succeed");
        cache.remove_meta().expect("Operation should succeed");
        assert!(!cache.meta_path().exists());
    }

    #[test]
    fn test_corrupt_footer_cache_ignored() {
        let dir = TempDir::new().expect("Operation should succeed");
        let cache = LocalCache::new(dir.path());
        let mut bytes = archive().footer.to_bytes().expect("Operation should succeed");
        bytes[0] ^= 0xff;
        fs::write(cache.footer_path(), bytes).expect("Operation should succeed");
        assert!(cache.load_footer().is_none());
    }

    #[test]
    fn test_fragment_paths() {
        let dir = Path::new("/games/dlc");
        let path = fragment_path(dir, "maps/desert/heightmap.bin").expect("Operation should succeed");
        assert_eq!(path, Path::new("/games/dlc/maps/desert/heightmap.bin.dvpl"));
        assert_eq!(
            fragment_name(dir, &path).as_deref(),
            Some("maps/desert/heightmap.bin")
        );

        assert!(fragment_path(dir, "../escape").is_err());
        assert!(fragment_path(dir, "/etc/passwd").is_err());
        assert!(fragment_path(dir, "").is_err());
        assert!(fragment_name(dir, Path::new("/games/dlc/readme.txt")).is_none());
    }
}
