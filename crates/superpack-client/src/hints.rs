//! Tuning knobs passed to [`DlcManager::initialize`](crate::DlcManager::initialize)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use superpack_protocol::DownloaderConfig;

/// Manager hints
///
/// Every field can be overridden from the environment with the `SUPERPACK_`
/// prefix, for example `SUPERPACK_RETRY_CONNECT_MS=1000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hints {
    /// Wait after a failed init step before asking for the footer again
    pub retry_connect_milliseconds: u64,

    /// Local fragment checks performed per update tick
    pub check_local_file_exist_per_update: usize,

    /// Superpacks listing more files than this are rejected
    pub max_files_to_download: usize,

    /// Longest silence tolerated by a single transfer
    pub timeout_for_download: Duration,

    /// Concurrent transfers
    pub downloader_max_handles: usize,

    /// Failed init attempts after which a valid local cache is trusted
    /// without the network
    pub skip_cdn_connect_after_attempts: u32,

    /// Time budget for one request queue update
    pub limit_request_update_iteration_ms: u64,

    /// Failed transfers or CRC checks of one file before its pack fails
    pub file_download_retries: u32,

    /// Transport retries inside the downloader for each transfer
    pub task_retries: u32,
}

impl Default for Hints {
    fn default() -> Self {
        Self {
            retry_connect_milliseconds: 5000,
            check_local_file_exist_per_update: 100,
            max_files_to_download: 22000,
            timeout_for_download: Duration::from_secs(30),
            downloader_max_handles: 8,
            skip_cdn_connect_after_attempts: 3,
            limit_request_update_iteration_ms: 10,
            file_download_retries: 3,
            task_retries: 3,
        }
    }
}

impl Hints {
    /// Defaults overridden by `SUPERPACK_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry_connect_milliseconds: env_or(
                "SUPERPACK_RETRY_CONNECT_MS",
                defaults.retry_connect_milliseconds,
            ),
            check_local_file_exist_per_update: env_or(
                "SUPERPACK_CHECK_LOCAL_PER_UPDATE",
                defaults.check_local_file_exist_per_update,
            ),
            max_files_to_download: env_or(
                "SUPERPACK_MAX_FILES",
                defaults.max_files_to_download,
            ),
            timeout_for_download: Duration::from_secs(env_or(
                "SUPERPACK_DOWNLOAD_TIMEOUT",
                defaults.timeout_for_download.as_secs(),
            )),
            downloader_max_handles: env_or(
                "SUPERPACK_MAX_HANDLES",
                defaults.downloader_max_handles,
            ),
            skip_cdn_connect_after_attempts: env_or(
                "SUPERPACK_SKIP_CDN_AFTER",
                defaults.skip_cdn_connect_after_attempts,
            ),
            limit_request_update_iteration_ms: env_or(
                "SUPERPACK_UPDATE_BUDGET_MS",
                defaults.limit_request_update_iteration_ms,
            ),
            file_download_retries: env_or(
                "SUPERPACK_FILE_RETRIES",
                defaults.file_download_retries,
            ),
            task_retries: env_or("SUPERPACK_TASK_RETRIES", defaults.task_retries),
        }
    }

    #[must_use]
    pub fn with_retry_connect_milliseconds(mut self, ms: u64) -> Self {
        self.retry_connect_milliseconds = ms;
        self
    }

    #[must_use]
    pub fn with_check_local_file_exist_per_update(mut self, count: usize) -> Self {
        self.check_local_file_exist_per_update = count;
        self
    }

    #[must_use]
    pub fn with_max_files_to_download(mut self, count: usize) -> Self {
        self.max_files_to_download = count;
        self
    }

    #[must_use]
    pub fn with_timeout_for_download(mut self, timeout: Duration) -> Self {
        self.timeout_for_download = timeout;
        self
    }

    #[must_use]
    pub fn with_downloader_max_handles(mut self, handles: usize) -> Self {
        self.downloader_max_handles = handles;
        self
    }

    #[must_use]
    pub fn with_skip_cdn_connect_after_attempts(mut self, attempts: u32) -> Self {
        self.skip_cdn_connect_after_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_file_download_retries(mut self, retries: u32) -> Self {
        self.file_download_retries = retries;
        self
    }

    #[must_use]
    pub fn with_task_retries(mut self, retries: u32) -> Self {
        self.task_retries = retries;
        self
    }

    /// Downloader settings matching these hints
    pub fn downloader_config(&self) -> DownloaderConfig {
        DownloaderConfig::default().with_max_handles(self.downloader_max_handles)
    }

    pub(crate) fn update_budget(&self) -> Duration {
        Duration::from_millis(self.limit_request_update_iteration_ms)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let hints = Hints::default();
        assert_eq!(hints.retry_connect_milliseconds, 5000);
        assert_eq!(hints.check_local_file_exist_per_update, 100);
        assert_eq!(hints.max_files_to_download, 22000);
        assert_eq!(hints.timeout_for_download, Duration::from_secs(30));
        assert_eq!(hints.downloader_max_handles, 8);
        assert_eq!(hints.skip_cdn_connect_after_attempts, 3);
        assert_eq!(hints.downloader_config().max_handles, 8);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let hints: Hints = serde_json::from_str(r#"{"downloader_max_handles": 2}"#)
            .expect("Operation should succeed");
        assert_eq!(hints.downloader_max_handles, 2);
        assert_eq!(hints.retry_connect_milliseconds, 5000);
    }
}
