//! Ordered queue of pack requests
//!
//! Requests live in an arena indexed by [`RequestHandle`]. Slots are never
//! reused, so a handle keeps identifying the same request for the lifetime
//! of the manager, across promotion from delayed to queued and across
//! requeues.
//!
//! Only the head of the queue downloads. Finished and failed heads are
//! popped and the next one starts in the same update while the time budget
//! lasts.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use superpack_formats::PackMetaData;
use superpack_protocol::Downloader;
use tracing::{debug, trace};

use crate::error::DlcResult;
use crate::events::{DlcEvent, EventQueue};
use crate::request::{PackContext, PackRequest, RequestHandle};

#[derive(Debug, Default)]
pub struct RequestManager {
    requests: Vec<Option<PackRequest>>,
    by_name: HashMap<String, RequestHandle>,
    queue: VecDeque<RequestHandle>,
    active: Option<RequestHandle>,
    in_background: bool,
    buffered: Vec<DlcEvent>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a delayed request for `name`
    pub(crate) fn create(&mut self, name: &str) -> RequestHandle {
        let handle = RequestHandle(self.requests.len());
        self.requests.push(Some(PackRequest::delayed(handle, name)));
        self.by_name.insert(name.to_string(), handle);
        handle
    }

    pub fn find(&self, name: &str) -> Option<RequestHandle> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, handle: RequestHandle) -> Option<&PackRequest> {
        self.requests.get(handle.0).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut PackRequest> {
        self.requests.get_mut(handle.0).and_then(Option::as_mut)
    }

    /// Live requests in creation order
    pub fn iter(&self) -> impl Iterator<Item = &PackRequest> {
        self.requests.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut PackRequest> {
        self.requests.iter_mut().flatten()
    }

    /// Snapshot of the queue, head first
    pub fn queue(&self) -> Vec<RequestHandle> {
        self.queue.iter().copied().collect()
    }

    pub fn is_queued(&self, handle: RequestHandle) -> bool {
        self.queue.contains(&handle)
    }

    pub fn active(&self) -> Option<RequestHandle> {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append to the queue unless already queued
    pub(crate) fn push(&mut self, handle: RequestHandle) {
        if self.get(handle).is_some() && !self.is_queued(handle) {
            trace!(request = %handle, "Queued");
            self.queue.push_back(handle);
        }
    }

    /// Move `handle` to the head, preceded by whichever queued requests are
    /// its transitive dependencies
    pub(crate) fn set_priority(
        &mut self,
        handle: RequestHandle,
        meta: &PackMetaData,
        downloader: &dyn Downloader,
    ) {
        if !self.is_queued(handle) {
            return;
        }
        let Some(pack) = self.get(handle).and_then(PackRequest::pack_index) else {
            return;
        };

        let mut dependencies = Vec::new();
        let mut others = Vec::new();
        for &queued in &self.queue {
            if queued == handle {
                continue;
            }
            let is_dependency = self
                .get(queued)
                .and_then(PackRequest::pack_index)
                .is_some_and(|other| other != pack && meta.is_child(pack, other));
            if is_dependency {
                dependencies.push(queued);
            } else {
                others.push(queued);
            }
        }

        self.queue = dependencies
            .into_iter()
            .chain(std::iter::once(handle))
            .chain(others)
            .collect();
        debug!(request = %handle, queue = ?self.queue, "Raised priority");

        if let Some(active) = self.active
            && self.queue.front() != Some(&active)
        {
            self.stop_active(downloader);
        }
    }

    /// Stop the active download, leaving it queued
    pub(crate) fn stop_active(&mut self, downloader: &dyn Downloader) {
        if let Some(active) = self.active.take()
            && let Some(request) = self.get_mut(active)
        {
            request.stop(downloader);
        }
    }

    /// Stop and forget a request
    pub(crate) fn remove(
        &mut self,
        handle: RequestHandle,
        downloader: &dyn Downloader,
    ) -> Option<PackRequest> {
        if self.active == Some(handle) {
            self.active = None;
        }
        self.queue.retain(|&queued| queued != handle);
        let mut request = self.requests.get_mut(handle.0)?.take()?;
        request.stop(downloader);
        self.by_name.remove(request.name());
        debug!(request = %handle, pack = request.name(), "Removed request");
        Some(request)
    }

    /// Stop everything and drop every request
    pub(crate) fn clear(&mut self, downloader: &dyn Downloader) {
        self.stop_active(downloader);
        for request in self.requests.iter_mut().flatten() {
            request.stop(downloader);
        }
        self.queue.clear();
        self.by_name.clear();
        self.buffered.clear();
        // keep the slots so stale handles never alias new requests
        self.requests.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn is_in_background(&self) -> bool {
        self.in_background
    }

    pub(crate) fn set_in_background(&mut self, in_background: bool) {
        self.in_background = in_background;
    }

    fn emit(&mut self, events: &mut EventQueue, event: DlcEvent) {
        if self.in_background {
            if !self.buffered.contains(&event) {
                self.buffered.push(event);
            }
        } else {
            events.push(event);
        }
    }

    /// Name of a failed request for one of `handle`'s direct dependencies
    fn failed_dependency(&self, handle: RequestHandle) -> Option<String> {
        let request = self.get(handle)?;
        request.dependencies().iter().find_map(|&dependency| {
            self.iter()
                .find(|other| other.pack_index() == Some(dependency))
                .filter(|other| other.is_failed())
                .map(|other| other.name().to_string())
        })
    }

    /// Drive the queue head for at most the hints' time budget
    ///
    /// Returns whether any request changed, including changes whose
    /// notifications are held back while in the background. A head whose
    /// dependency failed is failed too instead of being started.
    pub(crate) fn update(&mut self, ctx: &mut PackContext<'_>) -> DlcResult<bool> {
        let mut any_changed = false;
        if !self.in_background && !self.buffered.is_empty() {
            ctx.events.extend(self.buffered.drain(..));
            any_changed = true;
        }

        let deadline = Instant::now() + ctx.hints.update_budget();
        loop {
            let Some(&head) = self.queue.front() else {
                self.active = None;
                return Ok(any_changed);
            };

            let mut started = false;
            if self.active != Some(head) {
                self.stop_active(ctx.downloader);
                if let Some(dependency) = self.failed_dependency(head) {
                    if let Some(request) = self.get_mut(head) {
                        request.fail(format!("dependency {dependency} failed"));
                    }
                    self.queue.pop_front();
                    self.emit(ctx.events, DlcEvent::RequestUpdated(head));
                    any_changed = true;
                    continue;
                }
                if let Some(request) = self.get_mut(head) {
                    request.start(ctx);
                }
                self.active = Some(head);
                started = true;
                any_changed = true;
            }

            let Some(request) = self.get_mut(head) else {
                self.queue.pop_front();
                self.active = None;
                continue;
            };
            let changed = request.update(ctx)?;
            let finished = request.is_finished();
            any_changed |= changed;

            if started {
                self.emit(ctx.events, DlcEvent::RequestStartLoading(head));
            }
            if !finished {
                if changed {
                    self.emit(ctx.events, DlcEvent::RequestUpdated(head));
                }
                return Ok(any_changed);
            }

            self.queue.pop_front();
            self.active = None;
            any_changed = true;
            self.emit(ctx.events, DlcEvent::RequestUpdated(head));
            if Instant::now() >= deadline {
                return Ok(any_changed);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use superpack_formats::{CompressionType, FileTable, SuperpackBuilder, SuperpackFormat};
    use superpack_protocol::{Result, TaskId, TaskInfo, TaskRequest, TaskStatus};

    struct IdleDownloader;

    impl Downloader for IdleDownloader {
        fn start_task(&self, _request: TaskRequest) -> Result<TaskId> {
            Ok(TaskId::new(1))
        }
        fn remove_task(&self, _id: TaskId) {}
        fn wait_task(&self, _id: TaskId) -> Option<TaskStatus> {
            None
        }
        fn task_status(&self, _id: TaskId) -> Option<TaskStatus> {
            None
        }
        fn task_info(&self, _id: TaskId) -> Option<TaskInfo> {
            None
        }
        fn max_handles(&self) -> usize {
            1
        }
    }

    fn meta() -> (FileTable, PackMetaData) {
        let mut builder = SuperpackBuilder::new().with_compression(CompressionType::None);
        builder
            .pack("base", &[])
            .pack("mid", &["base"])
            .pack("top", &["mid"])
            .pack("other", &[])
            .add_file("base", "b", b"b".to_vec())
            .add_file("mid", "m", b"m".to_vec())
            .add_file("top", "t", b"t".to_vec())
            .add_file("other", "o", b"o".to_vec());
        let built = builder.build().expect("Operation should succeed");
        let table = FileTable::extract(&built.footer, built.file_table_bytes())
            .expect("Operation should succeed");
        let meta = PackMetaData::parse(built.meta_bytes()).expect("Operation should succeed");
        (table, meta)
    }

    fn queued(manager: &mut RequestManager, name: &str, table: &FileTable, meta: &PackMetaData) -> RequestHandle {
        let handle = manager.create(name);
        manager
            .get_mut(handle)
            .expect("Operation should succeed")
            .resolve(meta, table, &[false; 4])
            .expect("Operation should succeed");
        manager.push(handle);
        handle
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut manager = RequestManager::new();
        let a = manager.create("a");
        manager.remove(a, &IdleDownloader);
        let b = manager.create("b");
        assert_ne!(a, b);
        assert!(manager.get(a).is_none());
        assert_eq!(manager.find("b"), Some(b));
        assert!(manager.find("a").is_none());
    }

    #[test]
    fn test_priority_pulls_dependencies_forward() {
        let (table, meta) = meta();
        let mut manager = RequestManager::new();
        let other = queued(&mut manager, "other", &table, &meta);
        let base = queued(&mut manager, "base", &table, &meta);
        let top = queued(&mut manager, "top", &table, &meta);
        let mid = queued(&mut manager, "mid", &table, &meta);

        manager.set_priority(top, &meta, &IdleDownloader);
        assert_eq!(manager.queue(), vec![base, mid, top, other]);

        manager.set_priority(other, &meta, &IdleDownloader);
        assert_eq!(manager.queue(), vec![other, base, mid, top]);
    }

    #[test]
    fn test_push_is_idempotent() {
        let (table, meta) = meta();
        let mut manager = RequestManager::new();
        let base = queued(&mut manager, "base", &table, &meta);
        manager.push(base);
        manager.push(base);
        assert_eq!(manager.queue(), vec![base]);
    }
}
