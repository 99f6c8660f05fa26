//! HTTP implementation of [`Downloader`]
//!
//! A private multi-thread tokio runtime drives every transfer. The public
//! methods are synchronous: they touch the shared task map under a
//! `parking_lot` mutex and never wait on the network, except
//! [`Downloader::wait_task`] which parks on a condition variable.
//!
//! Concurrency is bounded by a semaphore with `max_handles` permits; tasks
//! beyond that stay in [`TaskState::JustAdded`] until a slot frees up.

use futures::StreamExt;
use parking_lot::{Condvar, Mutex};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::config::DownloaderConfig;
use crate::downloader::Downloader;
use crate::error::{DownloadError, Result, TaskError};
use crate::range::{ByteRange, ContentRange};
use crate::retry::RetryPolicy;
use crate::task::{
    Destination, TaskId, TaskInfo, TaskRequest, TaskState, TaskStatus, TaskType,
};
use crate::writer::{FileWriter, Writer};

struct TaskEntry {
    info: TaskInfo,
    status: TaskStatus,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Shared {
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    finished: Condvar,
}

impl Shared {
    fn update(&self, id: TaskId, f: impl FnOnce(&mut TaskStatus)) {
        if let Some(entry) = self.tasks.lock().get_mut(&id) {
            f(&mut entry.status);
        }
    }

    fn finish(&self, id: TaskId, outcome: Result<()>) {
        let mut tasks = self.tasks.lock();
        if let Some(entry) = tasks.get_mut(&id) {
            entry.status.state = TaskState::Finished;
            entry.abort = None;
            match outcome {
                Ok(()) => {
                    debug!(
                        task = %id,
                        url = %entry.info.url,
                        bytes = entry.status.size_downloaded,
                        "Task finished"
                    );
                }
                Err(e) => {
                    warn!(task = %id, url = %entry.info.url, error = %e, "Task failed");
                    entry.status.error = Some(TaskError::from(&e));
                }
            }
        }
        drop(tasks);
        self.finished.notify_all();
    }
}

/// State every spawned transfer needs
#[derive(Clone)]
struct Transfer {
    client: Client,
    shared: Arc<Shared>,
    slots: Arc<Semaphore>,
    retry_policy: RetryPolicy,
}

/// Downloader backed by `reqwest` on a dedicated tokio runtime
pub struct HttpDownloader {
    runtime: Option<Runtime>,
    transfer: Transfer,
    max_handles: usize,
    next_id: AtomicU64,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        Self::with_config(DownloaderConfig::default())
    }

    pub fn with_config(config: DownloaderConfig) -> Result<Self> {
        ensure_crypto_provider();
        let max_handles = config.max_handles.max(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("superpack-download")
            .enable_all()
            .build()
            .map_err(DownloadError::Runtime)?;

        let client = Self::build_client(&config)?;

        debug!(
            max_handles,
            worker_threads = config.worker_threads,
            "Created HTTP downloader"
        );

        Ok(Self {
            runtime: Some(runtime),
            transfer: Transfer {
                client,
                shared: Arc::new(Shared::default()),
                slots: Arc::new(Semaphore::new(max_handles)),
                retry_policy: config.retry_policy,
            },
            max_handles,
            next_id: AtomicU64::new(1),
        })
    }

    fn build_client(config: &DownloaderConfig) -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .https_only(false)
            // Byte ranges address the stored representation; never let the
            // transport transparently decode it
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(Into::into)
    }

    /// Number of tasks the engine currently tracks, finished ones included
    pub fn task_count(&self) -> usize {
        self.transfer.shared.tasks.lock().len()
    }
}

impl Downloader for HttpDownloader {
    fn start_task(&self, request: TaskRequest) -> Result<TaskId> {
        let runtime = self.runtime.as_ref().ok_or(DownloadError::ShuttingDown)?;
        if self.transfer.slots.is_closed() {
            return Err(DownloadError::ShuttingDown);
        }
        url::Url::parse(&request.url)?;

        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = request.info();
        trace!(task = %id, url = %info.url, kind = ?info.task_type, range = ?info.range, "Starting task");

        self.transfer.shared.tasks.lock().insert(
            id,
            TaskEntry {
                info,
                status: TaskStatus::new(),
                abort: None,
            },
        );

        let transfer = self.transfer.clone();
        let handle = runtime.spawn(async move {
            let outcome = transfer.run(id, request).await;
            transfer.shared.finish(id, outcome);
        });

        let mut tasks = self.transfer.shared.tasks.lock();
        if let Some(entry) = tasks.get_mut(&id)
            && !entry.status.is_finished()
        {
            entry.abort = Some(handle.abort_handle());
        }
        Ok(id)
    }

    fn remove_task(&self, id: TaskId) {
        let removed = self.transfer.shared.tasks.lock().remove(&id);
        if let Some(entry) = removed {
            if let Some(abort) = entry.abort {
                debug!(task = %id, url = %entry.info.url, "Cancelling task");
                abort.abort();
            }
            self.transfer.shared.finished.notify_all();
        }
    }

    fn wait_task(&self, id: TaskId) -> Option<TaskStatus> {
        let shared = &self.transfer.shared;
        let mut tasks = shared.tasks.lock();
        loop {
            match tasks.get(&id) {
                None => return None,
                Some(entry) if entry.status.is_finished() => return Some(entry.status.clone()),
                Some(_) => shared.finished.wait(&mut tasks),
            }
        }
    }

    fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.transfer
            .shared
            .tasks
            .lock()
            .get(&id)
            .map(|entry| entry.status.clone())
    }

    fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.transfer
            .shared
            .tasks
            .lock()
            .get(&id)
            .map(|entry| entry.info.clone())
    }

    fn max_handles(&self) -> usize {
        self.max_handles
    }
}

impl Drop for HttpDownloader {
    fn drop(&mut self) {
        self.transfer.slots.close();
        {
            let mut tasks = self.transfer.shared.tasks.lock();
            for entry in tasks.values_mut() {
                if let Some(abort) = entry.abort.take() {
                    abort.abort();
                }
                if !entry.status.is_finished() {
                    entry.status.state = TaskState::Finished;
                    entry.status.error = Some(TaskError::Cancelled);
                }
            }
        }
        self.transfer.shared.finished.notify_all();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Transfer {
    async fn run(&self, id: TaskId, request: TaskRequest) -> Result<()> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| DownloadError::ShuttingDown)?;
        self.shared.update(id, |status| status.state = TaskState::Downloading);

        let TaskRequest {
            url,
            destination,
            task_type,
            range,
            timeout,
            retries,
        } = request;

        if task_type == TaskType::SizeOnly {
            let total = self
                .retry_policy
                .clone()
                .with_max_attempts(retries)
                .execute(|| probe_size(&self.client, &url, timeout))
                .await?;
            self.shared.update(id, |status| status.size_total = total);
            return Ok(());
        }

        let mut writer = open_destination(destination, task_type)?;
        let location = writer.location().map(std::path::Path::to_path_buf);
        writer
            .prepare()
            .map_err(|e| DownloadError::from_writer(e, location.clone()))?;
        if task_type == TaskType::Full {
            writer
                .truncate()
                .map_err(|e| DownloadError::from_writer(e, location.clone()))?;
        }

        let mut attempt = 0;
        loop {
            match self
                .transfer_once(id, &url, range, timeout, writer.as_mut())
                .await
            {
                Ok(()) => break,
                Err(e) if e.should_retry() && attempt < retries => {
                    attempt += 1;
                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    warn!(
                        task = %id,
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transfer failed, retrying"
                    );
                    self.shared.update(id, |status| status.retries_used = attempt);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        writer
            .finish()
            .map_err(|e| DownloadError::from_writer(e, location))
    }

    /// One HTTP exchange, continuing from whatever the writer already holds
    async fn transfer_once(
        &self,
        id: TaskId,
        url: &str,
        range: Option<ByteRange>,
        timeout: Duration,
        writer: &mut dyn Writer,
    ) -> Result<()> {
        let location = writer_location(writer);
        let stored = writer.seek_pos();

        let (range_header, wanted) = match range {
            Some(range) => {
                let remaining = range.remaining(stored);
                self.shared.update(id, |status| {
                    status.size_total = range.size;
                    status.size_downloaded = stored.min(range.size);
                });
                if remaining.is_empty() {
                    return Ok(());
                }
                (Some((remaining.header_value(), remaining)), Some(remaining.size))
            }
            None if stored > 0 => (
                Some((format!("bytes={stored}-"), ByteRange::new(stored, 0))),
                None,
            ),
            None => (None, None),
        };

        let mut builder = self.client.get(url);
        if let Some((value, _)) = &range_header {
            builder = builder.header(RANGE, value.as_str());
        }
        let response = tokio::time::timeout(timeout, builder.send())
            .await
            .map_err(|_| DownloadError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus(status));
        }

        let mut wanted = wanted;
        match &range_header {
            Some((_, requested)) if status == StatusCode::PARTIAL_CONTENT => {
                if let Some(value) = header_str(&response, CONTENT_RANGE) {
                    let served = ContentRange::parse(value)?;
                    let consistent = if requested.size == 0 {
                        served.first == requested.offset
                    } else {
                        served.matches(requested)
                    };
                    if !consistent {
                        return Err(DownloadError::InvalidContentRange(value.to_string()));
                    }
                    if wanted.is_none() {
                        wanted = Some(served.len());
                        if let Some(total) = served.total {
                            self.shared.update(id, |s| s.size_total = total);
                        }
                    }
                }
            }
            Some(_) => return Err(DownloadError::RangeNotSupported),
            None => {
                wanted = header_u64(&response, CONTENT_LENGTH);
                if let Some(total) = wanted {
                    self.shared.update(id, |s| s.size_total = total);
                }
            }
        }

        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(timeout, stream.next())
                .await
                .map_err(|_| DownloadError::Timeout)?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            let take = match wanted {
                Some(wanted) => chunk.len().min((wanted - received) as usize),
                None => chunk.len(),
            };
            if take > 0 {
                writer
                    .save(&chunk[..take])
                    .map_err(|e| DownloadError::from_writer(e, location.clone()))?;
                received += take as u64;
                self.shared
                    .update(id, |s| s.size_downloaded = stored + received);
            }
            if wanted.is_some_and(|wanted| received >= wanted) {
                break;
            }
        }

        match wanted {
            Some(expected) if received < expected => {
                Err(DownloadError::IncompleteData { expected, received })
            }
            _ => Ok(()),
        }
    }
}

/// Learn the size of a remote resource
///
/// Tries `HEAD` first and falls back to a one-byte ranged `GET` when `HEAD`
/// is refused or carries no `Content-Length`.
async fn probe_size(client: &Client, url: &str, timeout: Duration) -> Result<u64> {
    let head = tokio::time::timeout(timeout, client.head(url).send()).await;
    match head {
        Ok(Ok(response)) if response.status().is_success() => {
            if let Some(size) = header_u64(&response, CONTENT_LENGTH) {
                return Ok(size);
            }
            debug!(url, "HEAD carried no Content-Length, probing with a range request");
        }
        Ok(Ok(response)) => {
            debug!(url, status = %response.status(), "HEAD refused, probing with a range request");
        }
        Ok(Err(e)) => debug!(url, error = %e, "HEAD failed, probing with a range request"),
        Err(_) => debug!(url, "HEAD timed out, probing with a range request"),
    }

    let response = tokio::time::timeout(
        timeout,
        client
            .get(url)
            .header(RANGE, ByteRange::new(0, 1).header_value())
            .send(),
    )
    .await
    .map_err(|_| DownloadError::Timeout)??;

    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            let value = header_str(&response, CONTENT_RANGE)
                .ok_or_else(|| DownloadError::SizeUnknown(url.to_string()))?;
            ContentRange::parse(value)?
                .total
                .ok_or_else(|| DownloadError::SizeUnknown(url.to_string()))
        }
        status if status.is_success() => header_u64(&response, CONTENT_LENGTH)
            .ok_or_else(|| DownloadError::SizeUnknown(url.to_string())),
        status => Err(DownloadError::HttpStatus(status)),
    }
}

fn open_destination(destination: Destination, task_type: TaskType) -> Result<Box<dyn Writer>> {
    match destination {
        Destination::Writer(writer) => Ok(writer),
        Destination::File(path) => {
            let opened = if task_type == TaskType::Resume {
                FileWriter::append(&path)
            } else {
                FileWriter::create(&path)
            };
            opened
                .map(|writer| Box::new(writer) as Box<dyn Writer>)
                .map_err(|e| DownloadError::from_writer(e, Some(path)))
        }
        Destination::Discard => Err(DownloadError::Writer(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "download task has no destination",
        ))),
    }
}

fn writer_location(writer: &dyn Writer) -> Option<std::path::PathBuf> {
    writer.location().map(std::path::Path::to_path_buf)
}

fn header_str(response: &Response, name: reqwest::header::HeaderName) -> Option<&str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    header_str(response, name).and_then(|v| v.trim().parse().ok())
}

/// Install the ring crypto provider for rustls once per process
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_url() {
        let downloader = HttpDownloader::new().expect("Operation should succeed");
        let err = downloader
            .start_task(TaskRequest::size_only("not a url"))
            .expect_err("URL must be validated");
        assert!(matches!(err, DownloadError::InvalidUrl(_)));
        assert_eq!(downloader.task_count(), 0);
    }

    #[test]
    fn test_unknown_task_queries() {
        let downloader = HttpDownloader::new().expect("Operation should succeed");
        let id = TaskId::new(999);
        assert!(downloader.task_status(id).is_none());
        assert!(downloader.task_info(id).is_none());
        assert!(downloader.wait_task(id).is_none());
        downloader.remove_task(id);
        downloader.remove_task(id);
        assert_eq!(downloader.max_handles(), 8);
    }
}
