//! Download sinks
//!
//! | Writer | Use |
//! |--------|-----|
//! | [`MemoryWriter`] | footer, file table and metadata fetches |
//! | [`FileWriter`] | plain file downloads |
//! | [`FragmentWriter`] | one superpack file stored as a verified `.dvpl` fragment |
//!
//! Writers run on the downloader's worker threads. A writer that rejects the
//! data (wrong size, wrong CRC) fails with [`io::ErrorKind::InvalidData`]; a
//! full device surfaces as [`io::ErrorKind::StorageFull`].

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use superpack_formats::{CompressionType, Crc32Hasher, FileTableEntry, LiteFooter};

/// Sink for downloaded bytes
pub trait Writer: Send {
    /// Append a chunk
    fn save(&mut self, data: &[u8]) -> io::Result<()>;

    /// Bytes stored so far; a resumed transfer continues from here
    fn seek_pos(&self) -> u64;

    /// Touch the backing storage before the first chunk
    ///
    /// Runs on the downloader's worker, never on the caller's thread, so
    /// writers that must open or re-read files do it here.
    fn prepare(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Drop everything stored and start over
    fn truncate(&mut self) -> io::Result<()>;

    /// Remaining capacity, `None` when unbounded
    fn space_left(&self) -> Option<u64> {
        None
    }

    /// Called once after the last chunk of a successful transfer
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// File this writer produces, if any
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// In-memory sink whose buffer stays readable after the task took the writer
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
    limit: Option<usize>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject data beyond `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::with_capacity(limit))),
            limit: Some(limit),
        }
    }

    /// Copy of the received bytes
    pub fn data(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Move the received bytes out, leaving the buffer empty
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock())
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Writer for MemoryWriter {
    fn save(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buffer = self.buffer.lock();
        if let Some(limit) = self.limit
            && buffer.len() + data.len() > limit
        {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "memory sink limit of {limit} bytes exceeded by {} bytes",
                    buffer.len() + data.len() - limit
                ),
            ));
        }
        buffer.extend_from_slice(data);
        Ok(())
    }

    fn seek_pos(&self) -> u64 {
        self.buffer.lock().len() as u64
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.buffer.lock().clear();
        Ok(())
    }

    fn space_left(&self) -> Option<u64> {
        self.limit
            .map(|limit| limit.saturating_sub(self.buffer.lock().len()) as u64)
    }
}

/// Plain file sink
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    file: File,
    position: u64,
}

impl FileWriter {
    /// Create or truncate `path`, creating parent directories
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        create_parent(&path)?;
        let file = File::create(&path)?;
        Ok(Self {
            path,
            file,
            position: 0,
        })
    }

    /// Open `path` for appending, keeping what is already there
    pub fn append(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        create_parent(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let position = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            position,
        })
    }
}

impl Writer for FileWriter {
    fn save(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn seek_pos(&self) -> u64 {
        self.position
    }

    fn truncate(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.position = 0;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// What a fragment must contain once complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSpec {
    pub compressed_size: u32,
    pub compressed_crc32: u32,
    pub original_size: u32,
    pub compression_type: CompressionType,
}

impl From<&FileTableEntry> for FragmentSpec {
    fn from(entry: &FileTableEntry) -> Self {
        Self {
            compressed_size: entry.compressed_size,
            compressed_crc32: entry.compressed_crc32,
            original_size: entry.original_size,
            compression_type: entry.compression_type,
        }
    }
}

/// Writes one superpack file as a local `.dvpl` fragment
///
/// Bytes go to `<fragment>.part` and are hashed as they arrive. `finish`
/// checks size and CRC32 against the file table entry, appends the
/// [`LiteFooter`] and renames the part file into place, so a `.dvpl` on disk
/// is always complete. A rejected part file is deleted.
///
/// Construction does no I/O. The part file is opened by
/// [`Writer::prepare`] (or the first write); an existing part file is then
/// re-hashed and the transfer continues after its last byte.
#[derive(Debug)]
pub struct FragmentWriter {
    path: PathBuf,
    part_path: PathBuf,
    file: Option<File>,
    hasher: Crc32Hasher,
    written: u64,
    spec: FragmentSpec,
}

impl FragmentWriter {
    pub fn new(path: impl Into<PathBuf>, spec: FragmentSpec) -> Self {
        let path = path.into();
        let part_path = part_path(&path);
        Self {
            path,
            part_path,
            file: None,
            hasher: Crc32Hasher::new(),
            written: 0,
            spec,
        }
    }

    /// Final fragment path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn part_file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            let file = self.open_part()?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("part file not open"))
    }

    fn open_part(&mut self) -> io::Result<File> {
        create_parent(&self.path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.part_path)?;

        self.hasher.reset();
        let existing = file.metadata()?.len();
        self.written = if existing > u64::from(self.spec.compressed_size) {
            file.set_len(0)?;
            0
        } else {
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                self.hasher.update(&chunk[..n]);
            }
            existing
        };
        file.seek(SeekFrom::Start(self.written))?;
        Ok(file)
    }

    fn reject(&self, message: String) -> io::Error {
        let _ = fs::remove_file(&self.part_path);
        io::Error::new(io::ErrorKind::InvalidData, message)
    }
}

impl Writer for FragmentWriter {
    fn save(&mut self, data: &[u8]) -> io::Result<()> {
        self.part_file()?;
        let expected = u64::from(self.spec.compressed_size);
        if self.written + data.len() as u64 > expected {
            return Err(self.reject(format!(
                "{} received more than the {expected} bytes expected",
                self.path.display()
            )));
        }
        self.part_file()?.write_all(data)?;
        self.hasher.update(data);
        self.written += data.len() as u64;
        Ok(())
    }

    fn seek_pos(&self) -> u64 {
        self.written
    }

    fn prepare(&mut self) -> io::Result<()> {
        self.part_file().map(|_| ())
    }

    fn truncate(&mut self) -> io::Result<()> {
        let file = self.part_file()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        self.hasher.reset();
        self.written = 0;
        Ok(())
    }

    fn space_left(&self) -> Option<u64> {
        Some(u64::from(self.spec.compressed_size).saturating_sub(self.written))
    }

    fn finish(&mut self) -> io::Result<()> {
        self.part_file()?;
        if self.written != u64::from(self.spec.compressed_size) {
            return Err(self.reject(format!(
                "{} is {} bytes, expected {}",
                self.path.display(),
                self.written,
                self.spec.compressed_size
            )));
        }
        let actual = self.hasher.sum();
        if actual != self.spec.compressed_crc32 {
            return Err(self.reject(format!(
                "{} crc32 0x{actual:08x}, expected 0x{:08x}",
                self.path.display(),
                self.spec.compressed_crc32
            )));
        }

        let trailer = LiteFooter::new(
            self.spec.original_size,
            self.spec.compressed_size,
            self.spec.compressed_crc32,
            self.spec.compression_type,
        )
        .to_bytes()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let file = self.part_file()?;
        file.write_all(&trailer)?;
        file.sync_data()?;
        fs::rename(&self.part_path, &self.path)
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Temporary path used while a fragment is incomplete
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use superpack_formats::{crc32, unpack_lite};
    use tempfile::TempDir;

    fn spec_for(data: &[u8]) -> FragmentSpec {
        FragmentSpec {
            compressed_size: data.len() as u32,
            compressed_crc32: crc32(data),
            original_size: data.len() as u32,
            compression_type: CompressionType::None,
        }
    }

    #[test]
    fn test_memory_writer_shares_buffer() {
        let reader = MemoryWriter::new();
        let mut writer: Box<dyn Writer> = Box::new(reader.clone());
        writer.save(b"DVPK").expect("Operation should succeed");
        writer.save(b"tail").expect("Operation should succeed");
        assert_eq!(writer.seek_pos(), 8);
        assert_eq!(reader.data(), b"DVPKtail");

        writer.truncate().expect("Operation should succeed");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_memory_writer_limit() {
        let mut writer = MemoryWriter::with_limit(4);
        writer.save(b"abc").expect("Operation should succeed");
        assert_eq!(writer.space_left(), Some(1));
        let err = writer.save(b"de").expect_err("Limit must hold");
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        assert_eq!(writer.data(), b"abc");
    }

    #[test]
    fn test_file_writer_append() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("nested/out.bin");

        let mut writer = FileWriter::create(&path).expect("Operation should succeed");
        writer.save(b"hello ").expect("Operation should succeed");
        writer.finish().expect("Operation should succeed");
        drop(writer);

        let mut writer = FileWriter::append(&path).expect("Operation should succeed");
        assert_eq!(writer.seek_pos(), 6);
        writer.save(b"world").expect("Operation should succeed");
        writer.finish().expect("Operation should succeed");

        assert_eq!(fs::read(&path).expect("Operation should succeed"), b"hello world");
    }

    #[test]
    fn test_fragment_writer_produces_dvpl() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("maps/desert.map.dvpl");
        let data = b"stored fragment bytes".to_vec();

        let mut writer = FragmentWriter::new(&path, spec_for(&data));
        writer.save(&data[..5]).expect("Operation should succeed");
        writer.save(&data[5..]).expect("Operation should succeed");
        assert!(!path.exists());
        writer.finish().expect("Operation should succeed");

        assert!(path.exists());
        assert!(!part_path(&path).exists());
        let footer = LiteFooter::read_from_path(&path).expect("Operation should succeed");
        assert_eq!(footer.crc32_compressed, crc32(&data));
        let bytes = fs::read(&path).expect("Operation should succeed");
        assert_eq!(unpack_lite(&bytes).expect("Operation should succeed"), data);
    }

    #[test]
    fn test_fragment_writer_defers_disk_access() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("deep/nested/e.dvpl");
        let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        fs::create_dir_all(path.parent().expect("Operation should succeed"))
            .expect("Operation should succeed");
        fs::write(part_path(&path), &data[..1000]).expect("Operation should succeed");

        let mut writer = FragmentWriter::new(&path, spec_for(&data));
        assert_eq!(writer.seek_pos(), 0);
        assert_eq!(
            fs::metadata(part_path(&path)).expect("Operation should succeed").len(),
            1000
        );

        writer.prepare().expect("Operation should succeed");
        assert_eq!(writer.seek_pos(), 1000);
        writer.save(&data[1000..]).expect("Operation should succeed");
        writer.finish().expect("Operation should succeed");
        let bytes = fs::read(&path).expect("Operation should succeed");
        assert_eq!(unpack_lite(&bytes).expect("Operation should succeed"), data);

        let fresh = dir.path().join("untouched/f.dvpl");
        let _writer = FragmentWriter::new(&fresh, spec_for(&data));
        assert!(!dir.path().join("untouched").exists());
    }

    #[test]
    fn test_fragment_writer_rejects_bad_crc() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("a.dvpl");
        let data = b"0123456789".to_vec();
        let mut spec = spec_for(&data);
        spec.compressed_crc32 ^= 1;

        let mut writer = FragmentWriter::new(&path, spec);
        writer.save(&data).expect("Operation should succeed");
        let err = writer.finish().expect_err("CRC mismatch must be detected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!path.exists());
        assert!(!part_path(&path).exists());
    }

    #[test]
    fn test_fragment_writer_rejects_overflow_and_short_data() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("b.dvpl");
        let data = b"abcdef".to_vec();

        let mut writer = FragmentWriter::new(&path, spec_for(&data));
        let err = writer.save(b"abcdefg").expect_err("Overflow must be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut writer = FragmentWriter::new(&path, spec_for(&data));
        writer.save(b"abc").expect("Operation should succeed");
        let err = writer.finish().expect_err("Short fragment must be rejected");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_fragment_writer_resumes_part_file() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("c.dvpl");
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();

        let mut writer = FragmentWriter::new(&path, spec_for(&data));
        writer.save(&data[..1234]).expect("Operation should succeed");
        drop(writer);

        let mut writer = FragmentWriter::new(&path, spec_for(&data));
        assert_eq!(writer.seek_pos(), 0);
        writer.prepare().expect("Operation should succeed");
        assert_eq!(writer.seek_pos(), 1234);
        assert_eq!(writer.space_left(), Some(5000 - 1234));
        writer.save(&data[1234..]).expect("Operation should succeed");
        writer.finish().expect("Operation should succeed");

        let bytes = fs::read(&path).expect("Operation should succeed");
        assert_eq!(unpack_lite(&bytes).expect("Operation should succeed"), data);
    }

    #[test]
    fn test_fragment_writer_discards_oversized_part() {
        let dir = TempDir::new().expect("Operation should succeed");
        let path = dir.path().join("d.dvpl");
        fs::write(part_path(&path), vec![0u8; 100]).expect("Operation should succeed");

        let mut writer = FragmentWriter::new(&path, spec_for(b"tiny"));
        writer.prepare().expect("Operation should succeed");
        assert_eq!(writer.seek_pos(), 0);
        assert_eq!(fs::metadata(part_path(&path)).expect("Operation should succeed").len(), 0);
    }
}
