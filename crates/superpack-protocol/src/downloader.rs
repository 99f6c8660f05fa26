//! The task-based download contract

use crate::error::Result;
use crate::task::{TaskId, TaskInfo, TaskRequest, TaskStatus};

/// A task-based transfer engine
///
/// Callers never touch a running task: they start it, poll its status from
/// their own thread and remove it when done. Implementations drive transfers
/// on their own threads and publish status under a lock.
pub trait Downloader: Send + Sync {
    /// Schedule a transfer
    ///
    /// Fails only when the engine cannot accept work (for example while
    /// shutting down or for an unparsable URL). Transfer failures are
    /// reported through [`TaskStatus::error`].
    fn start_task(&self, request: TaskRequest) -> Result<TaskId>;

    /// Cancel the task if it is still running and forget it
    ///
    /// Removing an unknown or already removed task is a no-op.
    fn remove_task(&self, id: TaskId);

    /// Block until the task finishes
    ///
    /// Returns `None` if the task is unknown or was removed while waiting.
    /// Not meant for per-frame callers.
    fn wait_task(&self, id: TaskId) -> Option<TaskStatus>;

    /// Non-blocking status snapshot
    fn task_status(&self, id: TaskId) -> Option<TaskStatus>;

    /// Description the task was started with
    fn task_info(&self, id: TaskId) -> Option<TaskInfo>;

    /// Number of transfers the engine runs at once; callers size their
    /// batches by it
    fn max_handles(&self) -> usize;
}
