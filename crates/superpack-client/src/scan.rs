//! Background scan of already downloaded fragments
//!
//! The scan starts with initialization and runs alongside the network
//! bootstrap. It walks the download directory, reading only the 20-byte
//! trailer of each `.dvpl` file, then blocks until the file table is posted
//! and cross-references what it found. The result comes back to the owning
//! thread as a single [`ScanOutcome`] message; the scan never touches
//! manager state.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use superpack_formats::{DVPL_EXTENSION, FileTable, LiteFooter};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::fragment_name;
use crate::error::{DlcError, DlcResult};

const PART_EXTENSION: &str = "part";
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// What the scan found on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// File indices whose fragment matches the file table
    pub ready: Vec<u32>,
    /// Truncated, stale or unknown files that were removed
    pub deleted: Vec<PathBuf>,
    /// Paths that could not be inspected or removed
    pub errors: Vec<(PathBuf, String)>,
    /// Fragments inspected
    pub scanned: usize,
}

#[derive(Debug, Default)]
struct Shared {
    table: Mutex<Option<Arc<FileTable>>>,
    posted: Condvar,
    cancel: AtomicBool,
}

impl Shared {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Handle to the running scan thread
#[derive(Debug)]
pub struct ScanThread {
    shared: Arc<Shared>,
    receiver: Receiver<ScanOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl ScanThread {
    pub fn start(dir: impl Into<PathBuf>) -> DlcResult<Self> {
        let dir = dir.into();
        let shared = Arc::new(Shared::default());
        let (sender, receiver) = mpsc::channel();

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("superpack-scan".to_string())
            .spawn(move || run(&dir, &thread_shared, &sender))
            .map_err(|e| DlcError::ScanThread(e.to_string()))?;

        Ok(Self {
            shared,
            receiver,
            handle: Some(handle),
        })
    }

    /// Unblock the cross-reference step
    pub fn post_metadata(&self, table: Arc<FileTable>) {
        *self.shared.table.lock() = Some(table);
        self.shared.posted.notify_all();
    }

    /// The scan result, once available
    ///
    /// Returns `None` while the scan is still running.
    pub fn try_result(&mut self) -> Option<DlcResult<ScanOutcome>> {
        match self.receiver.try_recv() {
            Ok(outcome) => {
                self.join();
                Some(Ok(outcome))
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.join();
                Some(Err(DlcError::ScanThread(
                    "scan thread exited without a result".to_string(),
                )))
            }
        }
    }

    /// Ask the scan to stop and wait for it
    pub fn cancel_and_join(&mut self) {
        self.shared.cancel.store(true, Ordering::Release);
        self.shared.posted.notify_all();
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Scan thread panicked");
        }
    }
}

impl Drop for ScanThread {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}

fn run(dir: &Path, shared: &Shared, sender: &Sender<ScanOutcome>) {
    let mut outcome = ScanOutcome::default();
    let mut fragments = Vec::new();
    let mut partials = Vec::new();

    for entry in WalkDir::new(dir).follow_links(false) {
        if shared.cancelled() {
            debug!("Scan cancelled while walking");
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map_or_else(|| dir.to_path_buf(), Path::to_path_buf);
                outcome.errors.push((path, e.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        match path.extension().and_then(OsStr::to_str) {
            Some(DVPL_EXTENSION) => {
                outcome.scanned += 1;
                match LiteFooter::read_from_path(&path) {
                    Ok(footer) => fragments.push((path, footer)),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Removing unreadable fragment");
                        delete(path, &mut outcome);
                    }
                }
            }
            Some(PART_EXTENSION) => partials.push(path),
            _ => {}
        }
    }

    let Some(table) = wait_for_table(shared) else {
        debug!("Scan cancelled while waiting for metadata");
        return;
    };
    let names = table.name_index();

    for (path, footer) in fragments {
        if shared.cancelled() {
            return;
        }
        let known = fragment_name(dir, &path)
            .and_then(|name| names.get(name.as_str()).copied())
            .and_then(|index| table.entry(index).map(|entry| (index, entry)));
        match known {
            Some((index, entry))
                if entry.compressed_size == footer.size_compressed
                    && entry.compressed_crc32 == footer.crc32_compressed =>
            {
                outcome.ready.push(index as u32);
            }
            Some((_, entry)) => {
                debug!(
                    path = %path.display(),
                    expected = format_args!("0x{:08x}", entry.compressed_crc32),
                    actual = format_args!("0x{:08x}", footer.crc32_compressed),
                    "Removing stale fragment"
                );
                delete(path, &mut outcome);
            }
            None => {
                debug!(path = %path.display(), "Removing fragment not in the file table");
                delete(path, &mut outcome);
            }
        }
    }

    for path in partials {
        let known = path
            .to_str()
            .and_then(|s| s.strip_suffix(".part"))
            .and_then(|fragment| fragment_name(dir, Path::new(fragment)))
            .is_some_and(|name| names.contains_key(name.as_str()));
        if !known {
            delete(path, &mut outcome);
        }
    }

    outcome.ready.sort_unstable();
    info!(
        scanned = outcome.scanned,
        ready = outcome.ready.len(),
        deleted = outcome.deleted.len(),
        "Local scan finished"
    );
    let _ = sender.send(outcome);
}

fn wait_for_table(shared: &Shared) -> Option<Arc<FileTable>> {
    let mut guard = shared.table.lock();
    loop {
        if shared.cancelled() {
            return None;
        }
        if let Some(table) = guard.as_ref() {
            return Some(Arc::clone(table));
        }
        shared.posted.wait_for(&mut guard, CANCEL_POLL);
    }
}

fn delete(path: PathBuf, outcome: &mut ScanOutcome) {
    match fs::remove_file(&path) {
        Ok(()) => outcome.deleted.push(path),
        Err(e) => outcome.errors.push((path, e.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Instant;
    use superpack_formats::{CompressionType, SuperpackBuilder};
    use tempfile::TempDir;

    fn table() -> (superpack_formats::BuiltSuperpack, Arc<FileTable>) {
        let mut builder = SuperpackBuilder::new().with_compression(CompressionType::Lz4);
        builder
            .pack("base", &[])
            .add_file("base", "maps/a.bin", b"a".repeat(500))
            .add_file("base", "maps/b.bin", b"b".repeat(500));
        let built = builder.build().expect("Operation should succeed");
        let table = FileTable::extract(&built.footer, built.file_table_bytes())
            .expect("Operation should succeed");
        (built, Arc::new(table))
    }

    fn write_fragment(dir: &Path, name: &str, stored: &[u8], entry: &superpack_formats::FileTableEntry) {
        let path = dir.join(format!("{name}.dvpl"));
        fs::create_dir_all(path.parent().expect("Operation should succeed"))
            .expect("Operation should succeed");
        let footer = LiteFooter::new(
            entry.original_size,
            entry.compressed_size,
            entry.compressed_crc32,
            entry.compression_type,
        );
        let mut bytes = stored.to_vec();
        bytes.extend(footer.to_bytes().expect("Operation should succeed"));
        fs::write(path, bytes).expect("Operation should succeed");
    }

    fn wait(scan: &mut ScanThread) -> ScanOutcome {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(result) = scan.try_result() {
                return result.expect("Operation should succeed");
            }
            assert!(Instant::now() < deadline, "scan did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_scan_cross_references_table() {
        let dir = TempDir::new().expect("Operation should succeed");
        let (built, table) = table();

        let a = table.entry(0).expect("Operation should succeed");
        write_fragment(dir.path(), "maps/a.bin", built.stored_file(0).expect("Operation should succeed"), a);

        // right size, wrong CRC
        let mut wrong = *table.entry(1).expect("Operation should succeed");
        wrong.compressed_crc32 ^= 1;
        write_fragment(dir.path(), "maps/b.bin", built.stored_file(1).expect("Operation should succeed"), &wrong);

        // not in the table
        write_fragment(dir.path(), "maps/c.bin", b"zz", &wrong_size(&wrong, 2));
        // truncated
        fs::write(dir.path().join("maps/d.bin.dvpl"), b"short").expect("Operation should succeed");
        // foreign file is left alone
        fs::write(dir.path().join("notes.txt"), b"keep").expect("Operation should succeed");

        let mut scan = ScanThread::start(dir.path()).expect("Operation should succeed");
        scan.post_metadata(Arc::clone(&table));
        let outcome = wait(&mut scan);

        assert_eq!(outcome.ready, vec![0]);
        assert_eq!(outcome.scanned, 4);
        assert_eq!(outcome.deleted.len(), 3);
        assert!(dir.path().join("maps/a.bin.dvpl").exists());
        assert!(!dir.path().join("maps/b.bin.dvpl").exists());
        assert!(!dir.path().join("maps/d.bin.dvpl").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    fn wrong_size(entry: &superpack_formats::FileTableEntry, size: u32) -> superpack_formats::FileTableEntry {
        let mut entry = *entry;
        entry.compressed_size = size;
        entry
    }

    #[test]
    fn test_unknown_part_files_removed() {
        let dir = TempDir::new().expect("Operation should succeed");
        let (_, table) = table();
        fs::create_dir_all(dir.path().join("maps")).expect("Operation should succeed");
        fs::write(dir.path().join("maps/a.bin.dvpl.part"), b"partial").expect("Operation should succeed");
        fs::write(dir.path().join("maps/zz.bin.dvpl.part"), b"partial").expect("Operation should succeed");

        let mut scan = ScanThread::start(dir.path()).expect("Operation should succeed");
        scan.post_metadata(table);
        let outcome = wait(&mut scan);

        assert!(outcome.ready.is_empty());
        assert!(dir.path().join("maps/a.bin.dvpl.part").exists());
        assert!(!dir.path().join("maps/zz.bin.dvpl.part").exists());
    }

    #[test]
    fn test_cancel_while_waiting_for_metadata() {
        let dir = TempDir::new().expect("Operation should succeed");
        let mut scan = ScanThread::start(dir.path()).expect("Operation should succeed");
        scan.cancel_and_join();
        assert!(matches!(scan.try_result(), Some(Err(DlcError::ScanThread(_)))));
    }
}
