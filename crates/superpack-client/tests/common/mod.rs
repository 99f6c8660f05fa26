//! Shared fixtures: an in-memory downloader serving a built superpack

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use superpack_client::{DlcEvent, DlcManager, Hints};
use superpack_formats::{BuiltSuperpack, CompressionType, SuperpackBuilder};
use superpack_protocol::{
    ByteRange, Destination, Downloader, Result, TaskError, TaskId, TaskInfo, TaskRequest,
    TaskState, TaskStatus, TaskType, Writer, is_storage_full,
};

pub const URL: &str = "https://cdn.test/superpack.dvpk";

/// Archive plus the original bytes of every file
pub struct Fixture {
    pub built: BuiltSuperpack,
    pub files: Vec<(&'static str, &'static str, Vec<u8>)>,
}

impl Fixture {
    /// `top -> mid -> base`, `extra` standalone
    pub fn new() -> Self {
        let files: Vec<(&'static str, &'static str, Vec<u8>)> = vec![
            ("base", "common/a.bin", b"alpha ".repeat(300)),
            ("base", "common/b.bin", (0..2000u32).map(|i| (i % 251) as u8).collect()),
            ("mid", "mid/m.bin", b"middle".repeat(200)),
            ("top", "top/t.bin", b"top of the world ".repeat(80)),
            ("top", "top/empty.bin", Vec::new()),
            ("extra", "extra/x.bin", b"x".repeat(4096)),
        ];
        let mut builder = SuperpackBuilder::new().with_compression(CompressionType::Lz4);
        builder
            .pack("base", &[])
            .pack("mid", &["base"])
            .pack("top", &["mid"])
            .pack("extra", &[]);
        for (pack, name, data) in &files {
            builder.add_file(pack, name, data.clone());
        }
        let built = builder.build().expect("Operation should succeed");
        Self { built, files }
    }

    pub fn index_of(&self, name: &str) -> usize {
        self.built
            .names
            .iter()
            .position(|n| n == name)
            .expect("Operation should succeed")
    }

    pub fn offset_of(&self, name: &str) -> u64 {
        self.built.entries[self.index_of(name)].start_position
    }

    pub fn original(&self, name: &str) -> &[u8] {
        &self.files[self.index_of(name)].2
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    tasks: HashMap<TaskId, (TaskInfo, TaskStatus)>,
    started: Vec<TaskInfo>,
    corrupt: HashMap<u64, u32>,
    no_space: bool,
    offline: bool,
    hold: bool,
}

/// Completes every task synchronously inside `start_task`
pub struct FakeDownloader {
    archive: Vec<u8>,
    max_handles: usize,
    inner: Mutex<Inner>,
}

impl FakeDownloader {
    pub fn new(archive: Vec<u8>) -> Self {
        Self {
            archive,
            max_handles: 4,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn started(&self) -> Vec<TaskInfo> {
        self.inner.lock().started.clone()
    }

    /// Transfers that began at `offset`
    pub fn starts_at(&self, offset: u64) -> usize {
        self.inner
            .lock()
            .started
            .iter()
            .filter(|info| info.range.is_some_and(|r| r.offset == offset))
            .count()
    }

    /// Flip a byte in the next `times` transfers starting at `offset`
    pub fn corrupt(&self, offset: u64, times: u32) {
        self.inner.lock().corrupt.insert(offset, times);
    }

    pub fn set_no_space(&self, enabled: bool) {
        self.inner.lock().no_space = enabled;
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Leave file transfers started from now on running forever
    pub fn set_hold(&self, hold: bool) {
        self.inner.lock().hold = hold;
    }

    /// Tasks still present and not finished
    pub fn in_flight(&self) -> Vec<TaskInfo> {
        self.inner
            .lock()
            .tasks
            .values()
            .filter(|(_, status)| !status.is_finished())
            .map(|(info, _)| info.clone())
            .collect()
    }

    fn run(&self, inner: &mut Inner, request: TaskRequest) -> TaskStatus {
        let mut status = TaskStatus::new();
        status.state = TaskState::Finished;
        let total = self.archive.len() as u64;

        if inner.offline {
            status.error = Some(TaskError::Transport("connection refused".to_string()));
            return status;
        }
        if request.task_type == TaskType::SizeOnly {
            status.size_total = total;
            return status;
        }
        let Destination::Writer(mut writer) = request.destination else {
            status.error = Some(TaskError::Io("unsupported destination".to_string()));
            return status;
        };

        let range = request.range.unwrap_or(ByteRange::new(0, total));
        status.size_total = range.size;
        let location = writer.location().map(PathBuf::from);
        if inner.no_space && location.is_some() {
            status.error = Some(TaskError::NoSpaceLeft(location.unwrap_or_default()));
            return status;
        }
        if inner.hold && location.is_some() {
            status.state = TaskState::Downloading;
            return status;
        }

        let result = (|| -> io::Result<u64> {
            writer.prepare()?;
            if request.task_type == TaskType::Full {
                writer.truncate()?;
            }
            let done = writer.seek_pos();
            let wanted = range.remaining(done);
            let mut data = self.archive[wanted.offset as usize..wanted.end() as usize].to_vec();
            if let Some(left) = inner.corrupt.get_mut(&range.offset)
                && *left > 0
                && !data.is_empty()
            {
                *left -= 1;
                data[0] ^= 0xff;
            }
            writer.save(&data)?;
            let written = writer.seek_pos();
            writer.finish()?;
            Ok(written)
        })();

        match result {
            Ok(written) => status.size_downloaded = written,
            Err(e) if is_storage_full(&e) => {
                status.error = Some(TaskError::NoSpaceLeft(location.unwrap_or_default()));
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                status.error = Some(TaskError::Verification(e.to_string()));
            }
            Err(e) => status.error = Some(TaskError::Io(e.to_string())),
        }
        status
    }
}

impl Downloader for FakeDownloader {
    fn start_task(&self, request: TaskRequest) -> Result<TaskId> {
        let info = request.info();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = TaskId::new(inner.next_id);
        inner.started.push(info.clone());
        let status = self.run(&mut inner, request);
        inner.tasks.insert(id, (info, status));
        Ok(id)
    }

    fn remove_task(&self, id: TaskId) {
        self.inner.lock().tasks.remove(&id);
    }

    fn wait_task(&self, id: TaskId) -> Option<TaskStatus> {
        self.task_status(id)
    }

    fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner.lock().tasks.get(&id).map(|(_, status)| status.clone())
    }

    fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.inner.lock().tasks.get(&id).map(|(info, _)| info.clone())
    }

    fn max_handles(&self) -> usize {
        self.max_handles
    }
}

pub fn hints() -> Hints {
    Hints::default()
        .with_retry_connect_milliseconds(0)
        .with_file_download_retries(2)
}

/// Tick the manager until `done` holds, collecting events
pub fn run_until(
    manager: &mut DlcManager,
    mut done: impl FnMut(&DlcManager) -> bool,
) -> Vec<DlcEvent> {
    let mut events = Vec::new();
    for _ in 0..10_000 {
        manager.update(Duration::from_millis(16));
        events.extend(manager.drain_events());
        if done(manager) {
            return events;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!(
        "condition not reached in state {} (last error: {:?})",
        manager.init_state(),
        manager.last_error_message()
    );
}

/// Tick a fixed number of times
pub fn tick(manager: &mut DlcManager, times: usize) -> Vec<DlcEvent> {
    let mut events = Vec::new();
    for _ in 0..times {
        manager.update(Duration::from_millis(16));
        events.extend(manager.drain_events());
    }
    events
}
