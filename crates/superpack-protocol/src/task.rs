//! Task model shared by every [`Downloader`](crate::Downloader)
//!
//! A caller describes a transfer with a [`TaskRequest`], receives an opaque
//! [`TaskId`], and from then on only polls [`TaskStatus`] snapshots or asks
//! for removal. The engine owns the task and its destination.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TaskError;
use crate::range::ByteRange;
use crate::writer::Writer;

/// Opaque task handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a task does with the remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Fetch from scratch; any existing destination content is discarded
    Full,
    /// Continue after the bytes the destination already holds
    Resume,
    /// Learn the resource size without transferring the body
    SizeOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    JustAdded,
    Downloading,
    Finished,
}

/// Where downloaded bytes go
pub enum Destination {
    /// A file path; created (or appended to for [`TaskType::Resume`])
    File(PathBuf),
    /// A caller-supplied sink
    Writer(Box<dyn Writer>),
    /// Nothing is written ([`TaskType::SizeOnly`])
    Discard,
}

impl Destination {
    /// Short human-readable form for logs and [`TaskInfo`]
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Writer(writer) => writer
                .location()
                .map_or_else(|| "<memory>".to_string(), |p| p.display().to_string()),
            Self::Discard => "<none>".to_string(),
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Destination({})", self.describe())
    }
}

/// Everything needed to start a task
#[derive(Debug)]
pub struct TaskRequest {
    pub url: String,
    pub destination: Destination,
    pub task_type: TaskType,
    /// Slice of the resource; `None` means the whole body
    pub range: Option<ByteRange>,
    /// Longest silence tolerated between two chunks
    pub timeout: Duration,
    /// Automatic retries on transient transport errors
    pub retries: u32,
}

impl TaskRequest {
    pub fn new(url: impl Into<String>, destination: Destination, task_type: TaskType) -> Self {
        Self {
            url: url.into(),
            destination,
            task_type,
            range: None,
            timeout: Duration::from_secs(30),
            retries: 3,
        }
    }

    /// Download the whole resource into `destination`
    pub fn full(url: impl Into<String>, destination: Destination) -> Self {
        Self::new(url, destination, TaskType::Full)
    }

    /// Continue a previous download into `destination`
    pub fn resume(url: impl Into<String>, destination: Destination) -> Self {
        Self::new(url, destination, TaskType::Resume)
    }

    /// Ask for the resource size only
    pub fn size_only(url: impl Into<String>) -> Self {
        Self::new(url, Destination::Discard, TaskType::SizeOnly)
    }

    #[must_use]
    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Snapshot of the descriptive part, kept by the engine after the
    /// destination has been handed to the transfer
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            url: self.url.clone(),
            destination: self.destination.describe(),
            task_type: self.task_type,
            range: self.range,
            timeout: self.timeout,
            retries: self.retries,
        }
    }
}

/// Immutable description of a started task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub url: String,
    pub destination: String,
    pub task_type: TaskType,
    pub range: Option<ByteRange>,
    pub timeout: Duration,
    pub retries: u32,
}

/// Progress and outcome of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Set once the task finished unsuccessfully
    pub error: Option<TaskError>,
    /// Bytes this task is expected to deliver, or the probed size for
    /// [`TaskType::SizeOnly`]
    pub size_total: u64,
    /// Bytes the destination holds, including bytes present before a resume
    pub size_downloaded: u64,
    /// Retries consumed so far
    pub retries_used: u32,
}

impl TaskStatus {
    pub const fn new() -> Self {
        Self {
            state: TaskState::JustAdded,
            error: None,
            size_total: 0,
            size_downloaded: 0,
            retries_used: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    /// Finished without error
    pub fn is_success(&self) -> bool {
        self.is_finished() && self.error.is_none()
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::MemoryWriter;

    #[test]
    fn test_request_builders() {
        let request = TaskRequest::full(
            "http://cdn.example/superpack.dvpk",
            Destination::Writer(Box::new(MemoryWriter::new())),
        )
        .with_range(ByteRange::new(100, 36))
        .with_timeout(Duration::from_secs(5))
        .with_retries(1);

        let info = request.info();
        assert_eq!(info.task_type, TaskType::Full);
        assert_eq!(info.destination, "<memory>");
        assert_eq!(info.range, Some(ByteRange::new(100, 36)));
        assert_eq!(info.retries, 1);

        let probe = TaskRequest::size_only("http://cdn.example/superpack.dvpk").info();
        assert_eq!(probe.task_type, TaskType::SizeOnly);
        assert_eq!(probe.destination, "<none>");
    }

    #[test]
    fn test_status_flags() {
        let mut status = TaskStatus::new();
        assert!(!status.is_finished());
        status.state = TaskState::Finished;
        assert!(status.is_success());
        status.error = Some(TaskError::Cancelled);
        assert!(!status.is_success());
        assert_eq!(TaskId::new(7).to_string(), "#7");
    }
}
