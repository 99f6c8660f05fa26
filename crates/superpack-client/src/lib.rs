//! # superpack-client - on-demand pack delivery from a remote superpack
//!
//! Bootstraps from the trailing blocks of a remote superpack, keeps a local
//! copy of them, and downloads named packs (plus their dependencies) into a
//! directory of verified `.dvpl` fragments.
//!
//! ## Architecture Overview
//!
//! 1. **Manager** ([`DlcManager`]): frame-driven, never blocks. Runs the
//!    initialization state machine ([`InitState`]), owns the
//!    `file_ready` bitmap and the request arena, and emits [`DlcEvent`]s.
//! 2. **Queue** ([`RequestManager`]): one active pack at a time, dependency
//!    packs always ahead of their dependents.
//! 3. **Requests** ([`PackRequest`]): per-file state machines feeding a
//!    [`Downloader`](superpack_protocol::Downloader).
//! 4. **Scan** ([`ScanThread`]): walks the download directory on its own
//!    thread and reports which fragments are already complete.
//!
//! ## Threads
//!
//! | Thread | Touches |
//! |--------|---------|
//! | owner (calls `update`) | all manager state |
//! | downloader runtime | task table, behind its own lock |
//! | `superpack-scan` | the filesystem, then one message back |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use superpack_client::{DlcEvent, DlcManager, Hints};
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let hints = Hints::from_env();
//!     let mut manager = DlcManager::http(&hints)?;
//!     let request = manager.request_pack("level1")?;
//!     manager.initialize("./dlc", "https://cdn.example.com/superpack.dvpk", hints)?;
//!
//!     loop {
//!         manager.update(Duration::from_millis(16));
//!         for event in manager.drain_events() {
//!             if let DlcEvent::NoSpaceLeftOnDevice(path) = event {
//!                 eprintln!("disk full at {}", path.display());
//!             }
//!         }
//!         if manager.request(request).is_some_and(|r| r.is_finished()) {
//!             break;
//!         }
//!         std::thread::sleep(Duration::from_millis(16));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::uninlined_format_args)] // Backwards compatibility
#![allow(clippy::doc_markdown)] // Pack terms don't need backticks
#![allow(clippy::missing_errors_doc)] // Error conditions documented on the types
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred

pub mod cache;
pub mod error;
pub mod events;
pub mod hints;
pub mod manager;
pub mod request;
pub mod request_manager;
pub mod scan;

pub use cache::{LocalCache, fragment_name, fragment_path};
pub use error::{DlcError, DlcResult};
pub use events::{DlcEvent, EventQueue};
pub use hints::Hints;
pub use manager::{DlcManager, InitState, Progress};
pub use request::{FileRequest, FileStatus, PackRequest, PackState, RequestHandle};
pub use request_manager::RequestManager;
pub use scan::{ScanOutcome, ScanThread};
