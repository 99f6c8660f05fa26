//! # superpack-protocol - task-based HTTP range download engine
//!
//! Moves bytes for the superpack client: the trailing footer of a remote
//! archive, its file table and metadata, and every individual file as a
//! verified local fragment.
//!
//! ## Architecture Overview
//!
//! 1. **Contract** ([`Downloader`]): start a task, poll its [`TaskStatus`],
//!    remove it. Callers never block except through
//!    [`Downloader::wait_task`].
//! 2. **Engine** ([`HttpDownloader`]): `reqwest` on a private tokio runtime,
//!    at most `max_handles` transfers at once, retries with backoff for
//!    transient failures, resumable byte ranges.
//! 3. **Sinks** ([`Writer`]): memory buffers, plain files, and
//!    [`FragmentWriter`] which CRC-checks a file as it arrives and only
//!    publishes a complete `.dvpl` fragment.
//!
//! ## Error classification
//!
//! | Failure | Outcome |
//! |---------|---------|
//! | connect error, timeout, short body | retried up to the task's budget |
//! | HTTP 4xx/5xx | terminal, [`TaskError::HttpStatus`] |
//! | device full | terminal, [`TaskError::NoSpaceLeft`] |
//! | size or CRC mismatch in the sink | terminal, [`TaskError::Verification`] |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use superpack_protocol::{ByteRange, Destination, Downloader, HttpDownloader, MemoryWriter, TaskRequest};
//!
//! fn fetch_tail(url: &str, total: u64) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
//!     let downloader = HttpDownloader::new()?;
//!     let sink = MemoryWriter::new();
//!     let id = downloader.start_task(
//!         TaskRequest::full(url, Destination::Writer(Box::new(sink.clone())))
//!             .with_range(ByteRange::new(total - 36, 36)),
//!     )?;
//!     let status = downloader.wait_task(id).ok_or("task vanished")?;
//!     downloader.remove_task(id);
//!     if let Some(error) = status.error {
//!         return Err(error.into());
//!     }
//!     Ok(sink.take())
//! }
//! ```

#![allow(clippy::uninlined_format_args)] // Backwards compatibility
#![allow(clippy::doc_markdown)] // Protocol terms don't need backticks
#![allow(clippy::missing_errors_doc)] // Error conditions documented on the types
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred

pub mod config;
pub mod downloader;
pub mod error;
pub mod http;
pub mod range;
pub mod retry;
pub mod task;
pub mod writer;

pub use config::DownloaderConfig;
pub use downloader::Downloader;
pub use error::{DownloadError, DownloadResult, Result, TaskError, is_storage_full};
pub use http::{HttpDownloader, ensure_crypto_provider};
pub use range::{ByteRange, ContentRange};
pub use retry::RetryPolicy;
pub use task::{Destination, TaskId, TaskInfo, TaskRequest, TaskState, TaskStatus, TaskType};
pub use writer::{FileWriter, FragmentSpec, FragmentWriter, MemoryWriter, Writer, part_path};
