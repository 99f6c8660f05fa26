//! The DLC manager
//!
//! [`DlcManager`] is driven by the owner's frame loop through
//! [`DlcManager::update`] and never blocks. Initialization is a linear state
//! machine:
//!
//! ```text
//! Starting -> AskFooter -> GetFooter -> AskFileTable -> GetFileTable
//!   -> CompareLocalMetaWithRemoteHash -> [AskMeta -> GetMeta -> ParseMeta]
//!   -> LoadPacksDataFromMeta -> WaitScanThreadToFinish
//!   -> MoveDelayedRequestsToQueue -> Ready
//! ```
//!
//! Any failure before `Ready` moves to `Offline`, which waits
//! `retry_connect_milliseconds` of frame time and starts over at
//! `AskFooter`. Blocks already present in the local cache skip their
//! network round-trip.

use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use superpack_formats::{
    FOOTER_SIZE, FileTable, FormatError, PackMetaData, SuperpackFooter, SuperpackFormat, crc32,
};
use superpack_protocol::{
    ByteRange, Destination, Downloader, HttpDownloader, MemoryWriter, TaskError, TaskId,
    TaskRequest, TaskStatus, part_path,
};
use tracing::{debug, error, info, warn};

use crate::cache::{LocalCache, fragment_path, remove_if_exists};
use crate::error::{DlcError, DlcResult};
use crate::events::{DlcEvent, EventQueue};
use crate::hints::Hints;
use crate::request::{PackContext, PackRequest, RequestHandle};
use crate::request_manager::RequestManager;
use crate::scan::ScanThread;

/// Bound on state transitions taken in one update
const MAX_INIT_STEPS_PER_UPDATE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InitState {
    Starting,
    AskFooter,
    GetFooter,
    AskFileTable,
    GetFileTable,
    CompareLocalMetaWithRemoteHash,
    AskMeta,
    GetMeta,
    ParseMeta,
    LoadPacksDataFromMeta,
    WaitScanThreadToFinish,
    MoveDelayedRequestsToQueue,
    Ready,
    /// Waiting to retry after a failed step
    Offline,
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "Starting",
            Self::AskFooter => "AskFooter",
            Self::GetFooter => "GetFooter",
            Self::AskFileTable => "AskFileTable",
            Self::GetFileTable => "GetFileTable",
            Self::CompareLocalMetaWithRemoteHash => "CompareLocalMetaWithRemoteHash",
            Self::AskMeta => "AskMeta",
            Self::GetMeta => "GetMeta",
            Self::ParseMeta => "ParseMeta",
            Self::LoadPacksDataFromMeta => "LoadPacksDataFromMeta",
            Self::WaitScanThreadToFinish => "WaitScanThreadToFinish",
            Self::MoveDelayedRequestsToQueue => "MoveDelayedRequestsToQueue",
            Self::Ready => "Ready",
            Self::Offline => "Offline",
        };
        f.write_str(name)
    }
}

/// Byte totals over the whole superpack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Stored size of every file
    pub total: u64,
    /// Stored size of files present locally
    pub already_downloaded: u64,
    /// Bytes still to fetch for queued requests
    pub in_queue: u64,
    pub is_requesting_enabled: bool,
}

enum Step {
    Next,
    Wait,
}

pub struct DlcManager {
    downloader: Arc<dyn Downloader>,
    hints: Hints,
    download_dir: PathBuf,
    superpack_url: String,
    cache: LocalCache,
    initialized: bool,
    state: InitState,

    init_task: Option<TaskId>,
    init_buffer: Option<MemoryWriter>,
    server_size: Option<u64>,
    footer: Option<SuperpackFooter>,
    file_table: Option<Arc<FileTable>>,
    meta_blob: Option<Vec<u8>>,
    meta: Option<PackMetaData>,
    file_ready: Vec<bool>,
    scan: Option<ScanThread>,

    requests: RequestManager,
    delayed: Vec<RequestHandle>,
    events: EventQueue,

    requesting_enabled: bool,
    no_space_reported: bool,
    retry_count: u32,
    retry_wait: Duration,
    last_error: Option<String>,
    progress: Cell<Option<Progress>>,
}

impl fmt::Debug for DlcManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DlcManager")
            .field("download_dir", &self.download_dir)
            .field("superpack_url", &self.superpack_url)
            .field("state", &self.state)
            .field("requests", &self.requests.queue())
            .field("delayed", &self.delayed)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

impl DlcManager {
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self {
            downloader,
            hints: Hints::default(),
            download_dir: PathBuf::new(),
            superpack_url: String::new(),
            cache: LocalCache::new(PathBuf::new()),
            initialized: false,
            state: InitState::Starting,
            init_task: None,
            init_buffer: None,
            server_size: None,
            footer: None,
            file_table: None,
            meta_blob: None,
            meta: None,
            file_ready: Vec::new(),
            scan: None,
            requests: RequestManager::new(),
            delayed: Vec::new(),
            events: EventQueue::new(),
            requesting_enabled: true,
            no_space_reported: false,
            retry_count: 0,
            retry_wait: Duration::ZERO,
            last_error: None,
            progress: Cell::new(None),
        }
    }

    /// Manager backed by an [`HttpDownloader`] sized by `hints`
    pub fn http(hints: &Hints) -> DlcResult<Self> {
        let downloader = HttpDownloader::with_config(hints.downloader_config())?;
        Ok(Self::new(Arc::new(downloader)))
    }

    /// Start bootstrapping against `superpack_url`, storing fragments in
    /// `download_dir`
    ///
    /// Requests made before this call are kept and promoted once metadata is
    /// available. Calling it again tears down the previous session first.
    pub fn initialize(
        &mut self,
        download_dir: impl Into<PathBuf>,
        superpack_url: impl Into<String>,
        hints: Hints,
    ) -> DlcResult<()> {
        if self.initialized {
            self.deinitialize();
        }
        let download_dir = download_dir.into();
        fs::create_dir_all(&download_dir).map_err(|e| DlcError::io(&download_dir, e))?;

        self.scan = Some(ScanThread::start(&download_dir)?);
        self.cache = LocalCache::new(&download_dir);
        self.download_dir = download_dir;
        self.superpack_url = superpack_url.into();
        self.hints = hints;
        self.initialized = true;
        self.state = InitState::Starting;
        self.retry_count = 0;
        self.last_error = None;
        self.progress.set(None);

        info!(
            dir = %self.download_dir.display(),
            url = %self.superpack_url,
            delayed = self.delayed.len(),
            "DLC manager initializing"
        );
        Ok(())
    }

    /// Stop the scan, cancel the bootstrap transfer and drop every request
    pub fn deinitialize(&mut self) {
        if let Some(mut scan) = self.scan.take() {
            scan.cancel_and_join();
        }
        self.remove_init_task();
        self.requests.clear(&*self.downloader);
        self.delayed.clear();
        self.reset_bootstrap();
        self.meta = None;
        self.file_table = None;
        self.file_ready.clear();
        self.initialized = false;
        self.state = InitState::Starting;
        self.progress.set(None);
        debug!("DLC manager deinitialized");
    }

    /// Metadata loaded, local scan merged and delayed requests queued
    pub fn is_initialized(&self) -> bool {
        self.state == InitState::Ready
    }

    pub fn init_state(&self) -> InitState {
        self.state
    }

    /// Failed bootstrap attempts since `initialize`
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error_message(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn meta(&self) -> Option<&PackMetaData> {
        self.meta.as_ref()
    }

    pub fn file_table(&self) -> Option<&FileTable> {
        self.file_table.as_deref()
    }

    /// Events produced since the last call, oldest first
    pub fn drain_events(&mut self) -> Vec<DlcEvent> {
        self.events.drain()
    }

    pub fn request(&self, handle: RequestHandle) -> Option<&PackRequest> {
        self.requests.get(handle)
    }

    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    /// Requests waiting for initialization, in promotion order
    pub fn delayed_requests(&self) -> &[RequestHandle] {
        &self.delayed
    }

    pub fn is_requesting_enabled(&self) -> bool {
        self.requesting_enabled
    }

    /// Start or stop downloading queued packs
    ///
    /// Re-enabling after a full device allows the next one to be reported.
    pub fn set_requesting_enabled(&mut self, enabled: bool) {
        if enabled == self.requesting_enabled {
            return;
        }
        self.requesting_enabled = enabled;
        if enabled {
            self.no_space_reported = false;
        } else {
            self.requests.stop_active(&*self.downloader);
        }
        self.progress.set(None);
        info!(enabled, "Requesting switched");
    }

    pub fn is_in_background(&self) -> bool {
        self.requests.is_in_background()
    }

    /// Buffer request notifications until back in the foreground
    pub fn set_in_background(&mut self, in_background: bool) {
        self.requests.set_in_background(in_background);
    }

    /// Advance bootstrap and downloads; `frame_delta` drives the retry clock
    pub fn update(&mut self, frame_delta: Duration) {
        if !self.initialized {
            return;
        }
        if self.state != InitState::Ready {
            self.update_init(frame_delta);
        }
        if self.state == InitState::Ready && self.requesting_enabled {
            self.update_requests();
        }
    }

    fn update_init(&mut self, frame_delta: Duration) {
        if self.state == InitState::Offline {
            self.retry_wait = self.retry_wait.saturating_sub(frame_delta);
            if !self.retry_wait.is_zero() {
                return;
            }
            debug!(attempt = self.retry_count, "Retrying superpack connection");
            self.state = InitState::AskFooter;
        }

        for _ in 0..MAX_INIT_STEPS_PER_UPDATE {
            let before = self.state;
            match self.step() {
                Ok(Step::Next) => {
                    debug!(from = %before, to = %self.state, "Init state changed");
                    if self.state == InitState::Ready {
                        return;
                    }
                }
                Ok(Step::Wait) => return,
                Err(e) => {
                    self.fail_init(e);
                    return;
                }
            }
        }
    }

    fn step(&mut self) -> DlcResult<Step> {
        match self.state {
            InitState::Starting => {
                self.state = InitState::AskFooter;
                Ok(Step::Next)
            }
            InitState::AskFooter => self.ask_footer(),
            InitState::GetFooter => self.get_footer(),
            InitState::AskFileTable => self.ask_file_table(),
            InitState::GetFileTable => self.get_file_table(),
            InitState::CompareLocalMetaWithRemoteHash => self.compare_local_meta(),
            InitState::AskMeta => self.ask_meta(),
            InitState::GetMeta => self.get_meta(),
            InitState::ParseMeta => self.parse_meta(),
            InitState::LoadPacksDataFromMeta => self.load_packs_data(),
            InitState::WaitScanThreadToFinish => self.wait_scan(),
            InitState::MoveDelayedRequestsToQueue => self.move_delayed_requests(),
            InitState::Ready | InitState::Offline => Ok(Step::Wait),
        }
    }

    fn ask_footer(&mut self) -> DlcResult<Step> {
        if self.init_task.is_none() && self.server_size.is_none() {
            if self.trust_local_cache() {
                return Ok(Step::Next);
            }
            let request = TaskRequest::size_only(self.superpack_url.as_str())
                .with_timeout(self.hints.timeout_for_download)
                .with_retries(self.hints.task_retries);
            self.init_task = Some(self.downloader.start_task(request)?);
            debug!(url = %self.superpack_url, "Probing superpack size");
        }

        if self.server_size.is_none() {
            let Some(status) = self.poll_init_task()? else {
                return Ok(Step::Wait);
            };
            let size = status.size_total;
            if size < FOOTER_SIZE as u64 {
                return Err(DlcError::ServerDataTooSmall {
                    size,
                    minimum: FOOTER_SIZE as u64,
                });
            }
            self.server_size = Some(size);
        }

        let size = self.server_size.unwrap_or_default();
        let range = ByteRange::tail(size, FOOTER_SIZE as u64).ok_or(DlcError::ServerDataTooSmall {
            size,
            minimum: FOOTER_SIZE as u64,
        })?;
        self.start_fetch(range)?;
        self.state = InitState::GetFooter;
        Ok(Step::Next)
    }

    /// Skip the network once enough attempts failed and every cached block
    /// is intact
    fn trust_local_cache(&mut self) -> bool {
        let threshold = self.hints.skip_cdn_connect_after_attempts;
        if threshold == 0 || self.retry_count < threshold {
            return false;
        }
        let Some(footer) = self.cache.load_footer() else {
            return false;
        };
        if self.cache.load_file_table(&footer).is_none() || self.cache.load_meta(&footer).is_none() {
            return false;
        }
        info!(
            attempts = self.retry_count,
            "Superpack unreachable, continuing from local cache"
        );
        self.footer = Some(footer);
        self.state = InitState::AskFileTable;
        true
    }

    fn get_footer(&mut self) -> DlcResult<Step> {
        let Some(bytes) = self.poll_fetch()? else {
            return Ok(Step::Wait);
        };
        let footer = SuperpackFooter::parse(&bytes)?;
        if let Some(size) = self.server_size {
            footer.validate_sizes(size)?;
        }
        let files = footer.info.num_files as usize;
        if files > self.hints.max_files_to_download {
            return Err(DlcError::TooManyFiles {
                files,
                limit: self.hints.max_files_to_download,
            });
        }
        self.cache.store_footer(&footer)?;
        self.events.push(DlcEvent::NetworkReady(true));
        debug!(
            files,
            table_bytes = footer.info.files_table_size,
            meta_bytes = footer.meta_data_size,
            meta_crc = format_args!("0x{:08x}", footer.meta_data_crc32),
            "Footer verified"
        );
        self.footer = Some(footer);
        self.state = InitState::AskFileTable;
        Ok(Step::Next)
    }

    fn ask_file_table(&mut self) -> DlcResult<Step> {
        let footer = self.current_footer()?;
        if let Some(bytes) = self.cache.load_file_table(&footer) {
            debug!("File table cache is current");
            self.file_table = Some(Arc::new(FileTable::extract(&footer, &bytes)?));
            self.state = InitState::CompareLocalMetaWithRemoteHash;
            return Ok(Step::Next);
        }
        if footer.info.files_table_size == 0 {
            self.file_table = Some(Arc::new(FileTable::extract(&footer, &[])?));
            self.state = InitState::CompareLocalMetaWithRemoteHash;
            return Ok(Step::Next);
        }
        let total = self.server_total()?;
        let offset = footer.files_table_offset(total)?;
        self.start_fetch(ByteRange::new(offset, u64::from(footer.info.files_table_size)))?;
        self.state = InitState::GetFileTable;
        Ok(Step::Next)
    }

    fn get_file_table(&mut self) -> DlcResult<Step> {
        let Some(bytes) = self.poll_fetch()? else {
            return Ok(Step::Wait);
        };
        let footer = self.current_footer()?;
        let table = FileTable::extract(&footer, &bytes)?;
        self.cache.store_file_table(&bytes)?;
        self.events.push(DlcEvent::NetworkReady(true));
        debug!(files = table.len(), "File table verified");
        self.file_table = Some(Arc::new(table));
        self.state = InitState::CompareLocalMetaWithRemoteHash;
        Ok(Step::Next)
    }

    fn compare_local_meta(&mut self) -> DlcResult<Step> {
        let footer = self.current_footer()?;
        if let Some(blob) = self.cache.load_meta(&footer) {
            debug!("Metadata cache is current");
            self.meta_blob = Some(blob);
            self.state = InitState::LoadPacksDataFromMeta;
        } else {
            self.cache.remove_meta()?;
            self.state = InitState::AskMeta;
        }
        Ok(Step::Next)
    }

    fn ask_meta(&mut self) -> DlcResult<Step> {
        let footer = self.current_footer()?;
        let total = self.server_total()?;
        let offset = footer.meta_data_offset(total)?;
        self.start_fetch(ByteRange::new(offset, u64::from(footer.meta_data_size)))?;
        self.state = InitState::GetMeta;
        Ok(Step::Next)
    }

    fn get_meta(&mut self) -> DlcResult<Step> {
        let Some(bytes) = self.poll_fetch()? else {
            return Ok(Step::Wait);
        };
        let footer = self.current_footer()?;
        let actual = crc32(&bytes);
        if bytes.len() != footer.meta_data_size as usize || actual != footer.meta_data_crc32 {
            return Err(FormatError::CrcMismatch {
                what: "metadata",
                expected: footer.meta_data_crc32,
                actual,
            }
            .into());
        }
        self.events.push(DlcEvent::NetworkReady(true));
        self.meta_blob = Some(bytes);
        self.state = InitState::ParseMeta;
        Ok(Step::Next)
    }

    fn parse_meta(&mut self) -> DlcResult<Step> {
        let blob = self.meta_blob.as_deref().ok_or(DlcError::NotInitialized)?;
        PackMetaData::parse(blob)?;
        self.cache.store_meta(blob)?;
        self.state = InitState::LoadPacksDataFromMeta;
        Ok(Step::Next)
    }

    fn load_packs_data(&mut self) -> DlcResult<Step> {
        let blob = self.meta_blob.take().ok_or(DlcError::NotInitialized)?;
        let meta = PackMetaData::parse(&blob)?;
        let table = self.file_table.clone().ok_or(DlcError::NotInitialized)?;
        if meta.file_count() != table.len() {
            return Err(DlcError::FileCountMismatch {
                meta: meta.file_count(),
                table: table.len(),
            });
        }
        self.file_ready = vec![false; meta.file_count()];
        info!(
            files = meta.file_count(),
            packs = meta.pack_count(),
            "Pack metadata loaded"
        );
        self.meta = Some(meta);
        if let Some(scan) = &self.scan {
            scan.post_metadata(table);
        }
        self.state = InitState::WaitScanThreadToFinish;
        Ok(Step::Next)
    }

    fn wait_scan(&mut self) -> DlcResult<Step> {
        let Some(scan) = self.scan.as_mut() else {
            self.state = InitState::MoveDelayedRequestsToQueue;
            return Ok(Step::Next);
        };
        let Some(result) = scan.try_result() else {
            return Ok(Step::Wait);
        };
        self.scan = None;

        match result {
            Ok(outcome) => {
                for index in outcome.ready {
                    if let Some(bit) = self.file_ready.get_mut(index as usize) {
                        *bit = true;
                    }
                }
                for (path, message) in outcome.errors {
                    self.events.push(DlcEvent::FileError { path, message });
                }
                if !outcome.deleted.is_empty() {
                    info!(removed = outcome.deleted.len(), "Removed stale local files");
                }
            }
            Err(e) => warn!(error = %e, "Local scan unavailable, verifying files on request"),
        }
        self.state = InitState::MoveDelayedRequestsToQueue;
        Ok(Step::Next)
    }

    fn move_delayed_requests(&mut self) -> DlcResult<Step> {
        self.state = InitState::Ready;
        let delayed = std::mem::take(&mut self.delayed);
        for handle in delayed {
            let Some(name) = self.requests.get(handle).map(|r| r.name().to_string()) else {
                continue;
            };
            if let Err(e) = self.enqueue_pack(&name) {
                warn!(pack = %name, error = %e, "Delayed request cannot be resolved");
                if let Some(request) = self.requests.get_mut(handle) {
                    request.fail(e.to_string());
                }
            }
        }

        let already_downloaded = self.file_ready.iter().filter(|ready| **ready).count();
        let total_files = self.file_ready.len();
        self.events.push(DlcEvent::InitializeFinished {
            already_downloaded,
            total_files,
        });
        self.progress.set(None);
        info!(
            already_downloaded,
            total_files,
            queued = self.requests.queue().len(),
            "DLC manager ready"
        );
        Ok(Step::Next)
    }

    fn fail_init(&mut self, err: DlcError) {
        if let Some(path) = err.no_space_path().cloned() {
            self.report_no_space(path);
        }
        self.retry_count += 1;
        warn!(
            state = %self.state,
            attempt = self.retry_count,
            error = %err,
            "Initialization step failed"
        );
        self.last_error = Some(err.to_string());
        self.remove_init_task();
        self.reset_bootstrap();
        self.events.push(DlcEvent::NetworkReady(false));
        self.retry_wait = Duration::from_millis(self.hints.retry_connect_milliseconds);
        self.state = InitState::Offline;
    }

    fn reset_bootstrap(&mut self) {
        self.init_buffer = None;
        self.server_size = None;
        self.footer = None;
        self.meta_blob = None;
        if self.meta.is_none() {
            self.file_table = None;
        }
    }

    fn current_footer(&self) -> DlcResult<SuperpackFooter> {
        self.footer.ok_or(DlcError::NotInitialized)
    }

    fn server_total(&self) -> DlcResult<u64> {
        self.server_size.ok_or(DlcError::NotInitialized)
    }

    fn start_fetch(&mut self, range: ByteRange) -> DlcResult<()> {
        let writer = MemoryWriter::new();
        self.init_buffer = Some(writer.clone());
        let request = TaskRequest::full(
            self.superpack_url.as_str(),
            Destination::Writer(Box::new(writer)),
        )
        .with_range(range)
        .with_timeout(self.hints.timeout_for_download)
        .with_retries(self.hints.task_retries);
        let task = self.downloader.start_task(request)?;
        debug!(task = %task, offset = range.offset, size = range.size, "Fetching superpack block");
        self.init_task = Some(task);
        Ok(())
    }

    fn poll_fetch(&mut self) -> DlcResult<Option<Vec<u8>>> {
        if self.poll_init_task()?.is_none() {
            return Ok(None);
        }
        let buffer = self.init_buffer.take().ok_or(DlcError::NotInitialized)?;
        Ok(Some(buffer.take()))
    }

    fn poll_init_task(&mut self) -> DlcResult<Option<TaskStatus>> {
        let task = self.init_task.ok_or(DlcError::NotInitialized)?;
        let Some(status) = self.downloader.task_status(task) else {
            self.init_task = None;
            return Err(TaskError::Cancelled.into());
        };
        if !status.is_finished() {
            return Ok(None);
        }
        self.downloader.remove_task(task);
        self.init_task = None;
        match status.error {
            Some(e) => Err(e.into()),
            None => Ok(Some(status)),
        }
    }

    fn remove_init_task(&mut self) {
        if let Some(task) = self.init_task.take() {
            self.downloader.remove_task(task);
        }
    }

    fn update_requests(&mut self) {
        let Some(file_table) = self.file_table.as_deref() else {
            return;
        };
        let mut ctx = PackContext {
            downloader: &*self.downloader,
            superpack_url: &self.superpack_url,
            download_dir: &self.download_dir,
            file_table,
            file_ready: &mut self.file_ready,
            hints: &self.hints,
            events: &mut self.events,
        };
        let result = self.requests.update(&mut ctx);
        if !matches!(result, Ok(false)) {
            self.progress.set(None);
        }
        if let Err(e) = result {
            if let Some(path) = e.no_space_path().cloned() {
                self.report_no_space(path);
            } else {
                warn!(error = %e, "Request update failed");
                self.last_error = Some(e.to_string());
            }
        }
    }

    fn report_no_space(&mut self, path: PathBuf) {
        error!(path = %path.display(), "No space left on device, requesting disabled");
        if !self.no_space_reported {
            self.no_space_reported = true;
            self.events.push(DlcEvent::NoSpaceLeftOnDevice(path));
        }
        self.requesting_enabled = false;
        self.requests.stop_active(&*self.downloader);
        self.progress.set(None);
    }

    /// Ask for a pack and, transitively, its dependencies
    ///
    /// Before initialization completes the request is recorded as delayed
    /// and its handle stays valid after promotion. Requesting the same pack
    /// again returns the same handle.
    pub fn request_pack(&mut self, name: &str) -> DlcResult<RequestHandle> {
        if self.state != InitState::Ready {
            if let Some(handle) = self.requests.find(name) {
                return Ok(handle);
            }
            let handle = self.requests.create(name);
            self.delayed.push(handle);
            debug!(pack = name, request = %handle, "Delayed request until initialized");
            return Ok(handle);
        }
        let handle = self.enqueue_pack(name)?;
        self.progress.set(None);
        Ok(handle)
    }

    /// Queue `name` behind its dependencies, creating or promoting requests
    fn enqueue_pack(&mut self, name: &str) -> DlcResult<RequestHandle> {
        let Self {
            meta,
            file_table,
            file_ready,
            requests,
            delayed,
            ..
        } = self;
        let meta = meta.as_ref().ok_or(DlcError::NotInitialized)?;
        let file_table = file_table.as_deref().ok_or(DlcError::NotInitialized)?;

        let root = meta.pack_index(name)?;
        let mut result = None;
        for pack in dependency_order(meta, root)? {
            let pack_name = meta.pack_info(superpack_formats::PackRef::Index(pack))?.pack_name.clone();
            let handle = requests
                .find(&pack_name)
                .unwrap_or_else(|| requests.create(&pack_name));
            let queued = requests.is_queued(handle);
            if let Some(request) = requests.get_mut(handle) {
                if request.is_delayed() {
                    request.resolve(meta, file_table, file_ready)?;
                    delayed.retain(|&d| d != handle);
                } else if request.is_failed() {
                    request.requeue();
                } else if !queued {
                    request.refresh(meta, file_table, file_ready);
                }
            }
            requests.push(handle);
            if pack == root {
                result = Some(handle);
            }
        }
        result.ok_or_else(|| FormatError::PackNotFound(name.to_string()).into())
    }

    /// Move a request to the head of the queue, behind its own dependencies
    pub fn set_request_priority(&mut self, handle: RequestHandle) {
        if self.state != InitState::Ready {
            if let Some(position) = self.delayed.iter().position(|&d| d == handle) {
                let handle = self.delayed.remove(position);
                self.delayed.insert(0, handle);
            }
            return;
        }
        if let Some(meta) = &self.meta {
            self.requests.set_priority(handle, meta, &*self.downloader);
        }
    }

    /// Delete a pack's local files, removing every pack that depends on it
    /// first
    pub fn remove_pack(&mut self, name: &str) -> DlcResult<()> {
        if self.state != InitState::Ready {
            if let Some(handle) = self.requests.find(name) {
                self.requests.remove(handle, &*self.downloader);
                self.delayed.retain(|&d| d != handle);
            }
            return Ok(());
        }

        let Self {
            meta,
            file_table,
            file_ready,
            requests,
            downloader,
            download_dir,
            ..
        } = self;
        let meta = meta.as_ref().ok_or(DlcError::NotInitialized)?;
        let file_table = file_table.as_deref().ok_or(DlcError::NotInitialized)?;

        let index = meta.pack_index(name)?;
        let mut packs: Vec<u32> = meta
            .dependents(index)
            .into_iter()
            .filter(|&dependent| dependent != index)
            .collect();
        packs.push(index);

        for pack in packs {
            let pack_name = &meta.pack_info(superpack_formats::PackRef::Index(pack))?.pack_name;
            if let Some(handle) = requests.find(pack_name) {
                requests.remove(handle, &**downloader);
            }
            for file in meta.file_indexes(pack_name) {
                if let Some(file_name) = file_table.name(file as usize) {
                    let path = fragment_path(download_dir, file_name)?;
                    remove_if_exists(&path)?;
                    remove_if_exists(&part_path(&path))?;
                }
                if let Some(bit) = file_ready.get_mut(file as usize) {
                    *bit = false;
                }
            }
            info!(pack = %pack_name, "Removed pack");
        }
        self.progress.set(None);
        Ok(())
    }

    /// Byte totals, recomputed after anything changed
    pub fn progress(&self) -> Progress {
        if let Some(progress) = self.progress.get() {
            return progress;
        }
        let mut progress = Progress {
            is_requesting_enabled: self.requesting_enabled,
            ..Progress::default()
        };
        if let Some(table) = self.file_table.as_deref() {
            for (index, ready) in self.file_ready.iter().enumerate() {
                let size = table.entry(index).map_or(0, |entry| u64::from(entry.compressed_size));
                progress.total += size;
                if *ready {
                    progress.already_downloaded += size;
                }
            }
        }
        progress.in_queue = self
            .requests
            .queue()
            .into_iter()
            .filter_map(|handle| self.requests.get(handle))
            .map(|request| request.total_size().saturating_sub(request.downloaded_size()))
            .sum();
        self.progress.set(Some(progress));
        progress
    }

    /// Whether every file of the pack and of its dependencies is present
    pub fn is_pack_downloaded(&self, name: &str) -> bool {
        let Some(meta) = &self.meta else {
            return false;
        };
        let Ok(index) = meta.pack_index(name) else {
            return false;
        };
        std::iter::once(index)
            .chain(meta.children(index).iter().copied())
            .filter_map(|pack| meta.packs().get(pack as usize))
            .all(|pack| {
                meta.file_indexes(&pack.pack_name)
                    .into_iter()
                    .all(|file| self.file_ready.get(file as usize).copied().unwrap_or(false))
            })
    }
}

impl Drop for DlcManager {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

/// Pack indices to enqueue for `root`, dependencies first
///
/// Iterative post-order walk; a dependency cycle is logged and cut.
fn dependency_order(meta: &PackMetaData, root: u32) -> DlcResult<Vec<u32>> {
    enum Visit {
        Enter(u32),
        Exit(u32),
    }

    let mut stack = vec![Visit::Enter(root)];
    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    let mut order = Vec::new();

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(pack) => {
                if done.contains(&pack) {
                    continue;
                }
                if !visiting.insert(pack) {
                    warn!(pack, "Dependency cycle detected, ignoring back edge");
                    continue;
                }
                stack.push(Visit::Exit(pack));
                let pack_name = &meta.pack_info(superpack_formats::PackRef::Index(pack))?.pack_name;
                for dependency in meta.pack_dependency_indexes(pack_name)?.into_iter().rev() {
                    if !done.contains(&dependency) {
                        stack.push(Visit::Enter(dependency));
                    }
                }
            }
            Visit::Exit(pack) => {
                done.insert(pack);
                order.push(pack);
            }
        }
    }
    Ok(order)
}
