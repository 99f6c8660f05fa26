//! Notifications produced by the manager
//!
//! Events are queued on the owning thread and handed out by
//! [`DlcManager::drain_events`](crate::DlcManager::drain_events), so listener
//! code never runs on a background thread.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::request::RequestHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlcEvent {
    /// The superpack server answered (`true`) or an init step failed (`false`)
    NetworkReady(bool),
    /// A request became the active download
    RequestStartLoading(RequestHandle),
    /// A request made visible progress, finished or failed
    RequestUpdated(RequestHandle),
    /// Writing failed for lack of space; requesting is now disabled
    NoSpaceLeftOnDevice(PathBuf),
    /// Metadata and local scan are ready
    InitializeFinished {
        already_downloaded: usize,
        total_files: usize,
    },
    /// A local file could not be read, written or verified
    FileError { path: PathBuf, message: String },
}

#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<DlcEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: DlcEvent) {
        self.events.push_back(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = DlcEvent>) {
        self.events.extend(events);
    }

    pub fn drain(&mut self) -> Vec<DlcEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
