//! Pack requests and their per-file download state
//!
//! A [`PackRequest`] covers the files of one named pack. Each file moves
//! through
//!
//! ```text
//! CheckLocalFile -> Ready
//!        |
//!        v
//! LoadingPackFile -> Ready
//!        ^    |
//!        |    v
//!        +- Error   (re-entered while retries remain)
//! ```
//!
//! Requests are addressed by [`RequestHandle`], an index into the request
//! arena owned by the [`RequestManager`](crate::RequestManager). A handle
//! obtained before initialization stays valid once the request is resolved
//! against the downloaded metadata.

use std::fmt;
use std::path::{Path, PathBuf};

use superpack_formats::{FileTable, FileTableEntry, LiteFooter, PackMetaData};
use superpack_protocol::{
    ByteRange, Destination, Downloader, FragmentSpec, FragmentWriter, TaskError, TaskId,
    TaskRequest, Writer, is_storage_full, part_path,
};
use tracing::{debug, warn};

use crate::cache::{fragment_path, remove_if_exists};
use crate::error::{DlcError, DlcResult};
use crate::events::{DlcEvent, EventQueue};
use crate::hints::Hints;

/// Stable identity of a pack request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub(crate) usize);

impl RequestHandle {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStatus {
    CheckLocalFile,
    LoadingPackFile,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackState {
    /// Requested before metadata was available
    Delayed,
    /// Waiting in the queue
    Queued,
    /// The active request
    Loading,
    Downloaded,
    Failed,
}

/// Download state of one superpack file
#[derive(Debug, Clone)]
pub struct FileRequest {
    file_index: u32,
    local_file: PathBuf,
    entry: FileTableEntry,
    status: FileStatus,
    downloaded_size: u64,
    attempts: u32,
    task: Option<TaskId>,
}

impl FileRequest {
    fn new(file_index: u32, local_file: PathBuf, entry: FileTableEntry) -> Self {
        Self {
            file_index,
            local_file,
            entry,
            status: FileStatus::CheckLocalFile,
            downloaded_size: 0,
            attempts: 0,
            task: None,
        }
    }

    pub fn file_index(&self) -> u32 {
        self.file_index
    }

    pub fn local_file(&self) -> &Path {
        &self.local_file
    }

    pub fn status(&self) -> FileStatus {
        self.status
    }

    pub fn compressed_crc32(&self) -> u32 {
        self.entry.compressed_crc32
    }

    pub fn compressed_size(&self) -> u32 {
        self.entry.compressed_size
    }

    pub fn uncompressed_size(&self) -> u32 {
        self.entry.original_size
    }

    pub fn downloaded_size(&self) -> u64 {
        self.downloaded_size
    }

    /// Failed transfers or verifications so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_in_flight(&self) -> bool {
        self.task.is_some()
    }

    fn mark_ready(&mut self) {
        self.status = FileStatus::Ready;
        self.downloaded_size = u64::from(self.entry.compressed_size);
        self.task = None;
    }

    /// A complete fragment with the expected trailer is already on disk
    fn local_fragment_valid(&self) -> bool {
        LiteFooter::read_from_path(&self.local_file).is_ok_and(|footer| {
            footer.size_compressed == self.entry.compressed_size
                && footer.crc32_compressed == self.entry.compressed_crc32
        })
    }
}

/// Everything a request needs from its manager while it runs
pub(crate) struct PackContext<'a> {
    pub downloader: &'a dyn Downloader,
    pub superpack_url: &'a str,
    pub download_dir: &'a Path,
    pub file_table: &'a FileTable,
    pub file_ready: &'a mut [bool],
    pub hints: &'a Hints,
    pub events: &'a mut EventQueue,
}

/// One outstanding request for a named pack
#[derive(Debug, Clone)]
pub struct PackRequest {
    handle: RequestHandle,
    name: String,
    state: PackState,
    pack_index: Option<u32>,
    dependencies: Vec<u32>,
    /// Files of the pack not yet ready when the request was resolved
    file_indexes: Vec<u32>,
    files: Vec<FileRequest>,
    total_size: u64,
    ready_size: u64,
    downloaded_size: u64,
    error: Option<String>,
}

impl PackRequest {
    pub(crate) fn delayed(handle: RequestHandle, name: &str) -> Self {
        Self {
            handle,
            name: name.to_string(),
            state: PackState::Delayed,
            pack_index: None,
            dependencies: Vec::new(),
            file_indexes: Vec::new(),
            files: Vec::new(),
            total_size: 0,
            ready_size: 0,
            downloaded_size: 0,
            error: None,
        }
    }

    /// Bind the request to the pack described by `meta`
    ///
    /// Used both for fresh requests and to promote a delayed one in place.
    pub(crate) fn resolve(
        &mut self,
        meta: &PackMetaData,
        file_table: &FileTable,
        file_ready: &[bool],
    ) -> DlcResult<()> {
        let pack_index = meta.pack_index(&self.name)?;
        self.dependencies = meta.pack_dependency_indexes(&self.name)?;
        self.pack_index = Some(pack_index);

        let all_files = meta.file_indexes(&self.name);
        self.total_size = all_files
            .iter()
            .filter_map(|&i| file_table.entry(i as usize))
            .map(|entry| u64::from(entry.compressed_size))
            .sum();
        self.file_indexes = all_files
            .into_iter()
            .filter(|&i| !file_ready.get(i as usize).copied().unwrap_or(false))
            .collect();
        self.files.clear();
        self.error = None;
        self.recount(file_table, file_ready);
        self.state = if self.file_indexes.is_empty() {
            PackState::Downloaded
        } else {
            PackState::Queued
        };
        debug!(
            request = %self.handle,
            pack = %self.name,
            missing = self.file_indexes.len(),
            total_bytes = self.total_size,
            "Resolved pack request"
        );
        Ok(())
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PackState {
        self.state
    }

    pub fn pack_index(&self) -> Option<u32> {
        self.pack_index
    }

    pub fn is_delayed(&self) -> bool {
        self.state == PackState::Delayed
    }

    pub fn is_downloaded(&self) -> bool {
        self.state == PackState::Downloaded
    }

    pub fn is_failed(&self) -> bool {
        self.state == PackState::Failed
    }

    /// Downloaded or failed
    pub fn is_finished(&self) -> bool {
        matches!(self.state, PackState::Downloaded | PackState::Failed)
    }

    /// Direct dependency pack indices
    pub fn dependencies(&self) -> &[u32] {
        &self.dependencies
    }

    pub fn file_indexes(&self) -> &[u32] {
        &self.file_indexes
    }

    pub fn files(&self) -> &[FileRequest] {
        &self.files
    }

    /// Stored bytes of every file in the pack
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Stored bytes present locally, including partial transfers
    pub fn downloaded_size(&self) -> u64 {
        self.downloaded_size
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn requeue(&mut self) {
        if matches!(self.state, PackState::Failed | PackState::Loading) {
            self.state = PackState::Queued;
        }
        self.error = None;
        for file in &mut self.files {
            if file.status == FileStatus::Error {
                file.status = FileStatus::LoadingPackFile;
                file.attempts = 0;
            }
        }
    }

    /// Re-derive readiness after local files changed underneath the request
    pub(crate) fn refresh(&mut self, meta: &PackMetaData, file_table: &FileTable, file_ready: &[bool]) {
        if self.is_delayed() || self.state == PackState::Loading {
            return;
        }
        let missing: Vec<u32> = meta
            .file_indexes(&self.name)
            .into_iter()
            .filter(|&i| !file_ready.get(i as usize).copied().unwrap_or(false))
            .collect();
        self.file_indexes = missing;
        self.files.clear();
        self.state = match self.state {
            _ if self.file_indexes.is_empty() => PackState::Downloaded,
            PackState::Downloaded => PackState::Queued,
            state => state,
        };
        self.recount(file_table, file_ready);
    }

    fn recount(&mut self, file_table: &FileTable, file_ready: &[bool]) {
        self.ready_size = self.total_size
            - self
                .file_indexes
                .iter()
                .filter(|&&i| !file_ready.get(i as usize).copied().unwrap_or(false))
                .filter_map(|&i| file_table.entry(i as usize))
                .map(|entry| u64::from(entry.compressed_size))
                .sum::<u64>()
                .min(self.total_size);
        self.downloaded_size = self.ready_size;
    }

    /// Become the active request and build the per-file state
    pub(crate) fn start(&mut self, ctx: &mut PackContext<'_>) {
        if self.is_finished() || self.is_delayed() {
            return;
        }
        if self.files.is_empty() {
            let files: DlcResult<Vec<FileRequest>> = self
                .file_indexes
                .iter()
                .filter_map(|&index| {
                    let entry = *ctx.file_table.entry(index as usize)?;
                    let name = ctx.file_table.name(index as usize).unwrap_or_default();
                    Some(
                        fragment_path(ctx.download_dir, name)
                            .map(|path| FileRequest::new(index, path, entry)),
                    )
                })
                .collect();
            match files {
                Ok(files) => self.files = files,
                Err(e) => {
                    self.fail(e.to_string());
                    return;
                }
            }
        }
        debug!(request = %self.handle, pack = %self.name, files = self.files.len(), "Starting pack");
        self.state = PackState::Loading;
    }

    /// Cancel in-flight transfers, keeping partial fragments for later
    pub(crate) fn stop(&mut self, downloader: &dyn Downloader) {
        for file in &mut self.files {
            if let Some(task) = file.task.take() {
                downloader.remove_task(task);
                file.status = FileStatus::LoadingPackFile;
            }
        }
        if self.state == PackState::Loading {
            debug!(request = %self.handle, pack = %self.name, "Stopped pack");
            self.state = PackState::Queued;
        }
    }

    pub(crate) fn fail(&mut self, message: String) {
        warn!(request = %self.handle, pack = %self.name, error = %message, "Pack failed");
        self.error = Some(message);
        self.state = PackState::Failed;
    }

    /// Advance the per-file state machines
    ///
    /// Returns whether visible progress happened. A full device is returned
    /// as [`DlcError::NoSpaceLeft`] so the manager can stop all requesting.
    pub(crate) fn update(&mut self, ctx: &mut PackContext<'_>) -> DlcResult<bool> {
        if self.state != PackState::Loading {
            return Ok(false);
        }
        let mut changed = false;

        self.check_local_files(ctx, &mut changed);
        let failure = self.poll_tasks(ctx, &mut changed)?;
        if let Some(message) = failure {
            self.stop(ctx.downloader);
            self.fail(message);
            return Ok(true);
        }
        if let Some(message) = self.issue_tasks(ctx, &mut changed)? {
            self.stop(ctx.downloader);
            self.fail(message);
            return Ok(true);
        }

        let downloaded: u64 = self.files.iter().map(|file| file.downloaded_size).sum();
        let done = self.ready_size
            + downloaded.min(self.total_size.saturating_sub(self.ready_size));
        if done != self.downloaded_size {
            self.downloaded_size = done;
            changed = true;
        }

        if self.files.iter().all(|file| file.status == FileStatus::Ready) {
            debug!(request = %self.handle, pack = %self.name, bytes = self.total_size, "Pack downloaded");
            self.state = PackState::Downloaded;
            changed = true;
        }
        Ok(changed)
    }

    fn check_local_files(&mut self, ctx: &mut PackContext<'_>, changed: &mut bool) {
        let mut budget = ctx.hints.check_local_file_exist_per_update.max(1);
        for file in &mut self.files {
            if file.status != FileStatus::CheckLocalFile {
                continue;
            }
            if budget == 0 {
                break;
            }
            budget -= 1;

            let index = file.file_index as usize;
            let known_ready = ctx.file_ready.get(index).copied().unwrap_or(false);
            if known_ready || file.local_fragment_valid() {
                file.mark_ready();
                if let Some(bit) = ctx.file_ready.get_mut(index) {
                    *bit = true;
                }
                *changed = true;
            } else {
                file.status = FileStatus::LoadingPackFile;
            }
        }
    }

    fn poll_tasks(
        &mut self,
        ctx: &mut PackContext<'_>,
        changed: &mut bool,
    ) -> DlcResult<Option<String>> {
        let retries = ctx.hints.file_download_retries;
        for file in &mut self.files {
            let Some(task) = file.task else { continue };
            let Some(status) = ctx.downloader.task_status(task) else {
                file.task = None;
                continue;
            };
            if !status.is_finished() {
                if status.size_downloaded != file.downloaded_size {
                    file.downloaded_size = status.size_downloaded;
                    *changed = true;
                }
                continue;
            }

            ctx.downloader.remove_task(task);
            file.task = None;
            *changed = true;
            match status.error {
                None => {
                    file.mark_ready();
                    if let Some(bit) = ctx.file_ready.get_mut(file.file_index as usize) {
                        *bit = true;
                    }
                }
                Some(TaskError::NoSpaceLeft(path)) => {
                    file.status = FileStatus::LoadingPackFile;
                    return Err(DlcError::NoSpaceLeft(path));
                }
                Some(error) => {
                    file.attempts += 1;
                    file.status = FileStatus::Error;
                    file.downloaded_size = 0;
                    warn!(
                        pack = %self.name,
                        file = %file.local_file.display(),
                        attempt = file.attempts,
                        error = %error,
                        "File download failed"
                    );
                    if matches!(error, TaskError::Verification(_))
                        && let Err(e) = remove_if_exists(&part_path(&file.local_file))
                    {
                        warn!(
                            file = %file.local_file.display(),
                            error = %e,
                            "Cannot remove rejected part file"
                        );
                    }
                    if file.attempts > retries {
                        ctx.events.push(DlcEvent::FileError {
                            path: file.local_file.clone(),
                            message: error.to_string(),
                        });
                        return Ok(Some(format!(
                            "{} failed after {} attempts: {error}",
                            file.local_file.display(),
                            file.attempts
                        )));
                    }
                }
            }
        }
        Ok(None)
    }

    fn issue_tasks(
        &mut self,
        ctx: &mut PackContext<'_>,
        changed: &mut bool,
    ) -> DlcResult<Option<String>> {
        let in_flight = self.files.iter().filter(|file| file.task.is_some()).count();
        let mut slots = ctx.downloader.max_handles().saturating_sub(in_flight);

        for file in &mut self.files {
            if slots == 0 {
                break;
            }
            let waiting = matches!(file.status, FileStatus::LoadingPackFile | FileStatus::Error)
                && file.task.is_none();
            if !waiting {
                continue;
            }

            let writer = FragmentWriter::new(&file.local_file, FragmentSpec::from(&file.entry));

            if file.entry.compressed_size == 0 {
                finish_empty(writer).map_err(|e| {
                    if is_storage_full(&e) {
                        DlcError::NoSpaceLeft(file.local_file.clone())
                    } else {
                        DlcError::io(&file.local_file, e)
                    }
                })?;
                file.mark_ready();
                if let Some(bit) = ctx.file_ready.get_mut(file.file_index as usize) {
                    *bit = true;
                }
                *changed = true;
                continue;
            }

            let range = ByteRange::new(
                file.entry.start_position,
                u64::from(file.entry.compressed_size),
            );
            let request = TaskRequest::resume(ctx.superpack_url, Destination::Writer(Box::new(writer)))
                .with_range(range)
                .with_timeout(ctx.hints.timeout_for_download)
                .with_retries(ctx.hints.task_retries);
            match ctx.downloader.start_task(request) {
                Ok(task) => {
                    file.task = Some(task);
                    file.status = FileStatus::LoadingPackFile;
                    slots -= 1;
                }
                Err(e) => {
                    return Ok(Some(format!(
                        "cannot schedule {}: {e}",
                        file.local_file.display()
                    )));
                }
            }
        }
        Ok(None)
    }
}

fn finish_empty(mut writer: FragmentWriter) -> std::io::Result<()> {
    writer.finish()
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use superpack_formats::{CompressionType, SuperpackBuilder, SuperpackFormat};

    fn sample() -> (FileTable, PackMetaData) {
        let mut builder = SuperpackBuilder::new().with_compression(CompressionType::Lz4);
        builder
            .pack("base", &[])
            .pack("level1", &["base"])
            .add_file("base", "a.txt", b"a".repeat(100))
            .add_file("level1", "b.txt", b"b".repeat(100))
            .add_file("base", "c.txt", b"c".repeat(100));
        let built = builder.build().expect("Operation should succeed");
        let table = FileTable::extract(&built.footer, built.file_table_bytes()).expect("Operation should succeed");
        let meta = PackMetaData::parse(built.meta_bytes()).expect("Operation should succeed");
        (table, meta)
    }

    #[test]
    fn test_delayed_request_resolves_in_place() {
        let (table, meta) = sample();
        let mut request = PackRequest::delayed(RequestHandle(4), "level1");
        assert!(request.is_delayed());
        assert!(request.dependencies().is_empty());

        request
            .resolve(&meta, &table, &[false, false, false])
            .expect("Operation should succeed");
        assert_eq!(request.handle(), RequestHandle(4));
        assert_eq!(request.state(), PackState::Queued);
        assert_eq!(request.pack_index(), Some(1));
        assert_eq!(request.dependencies(), &[0]);
        assert_eq!(request.file_indexes(), &[1]);
    }

    #[test]
    fn test_ready_files_are_excluded() {
        let (table, meta) = sample();
        let mut request = PackRequest::delayed(RequestHandle(0), "base");
        request
            .resolve(&meta, &table, &[true, false, false])
            .expect("Operation should succeed");
        assert_eq!(request.file_indexes(), &[2]);
        assert!(request.downloaded_size() > 0);

        request
            .resolve(&meta, &table, &[true, false, true])
            .expect("Operation should succeed");
        assert!(request.is_downloaded());
        assert_eq!(request.downloaded_size(), request.total_size());
    }

    #[test]
    fn test_unknown_pack_is_an_error() {
        let (table, meta) = sample();
        let mut request = PackRequest::delayed(RequestHandle(0), "nope");
        let err = request.resolve(&meta, &table, &[false; 3]).expect_err("Must fail");
        assert!(matches!(
            err,
            DlcError::Format(superpack_formats::FormatError::PackNotFound(_))
        ));
        assert!(request.is_delayed());
    }

    #[test]
    fn test_refresh_after_files_removed() {
        let (table, meta) = sample();
        let mut request = PackRequest::delayed(RequestHandle(0), "base");
        request
            .resolve(&meta, &table, &[true, true, true])
            .expect("Operation should succeed");
        assert!(request.is_downloaded());

        request.refresh(&meta, &table, &[false, true, true]);
        assert_eq!(request.state(), PackState::Queued);
        assert_eq!(request.file_indexes(), &[0]);
    }
}
