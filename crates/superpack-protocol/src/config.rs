//! Downloader configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Settings shared by every task of one downloader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloaderConfig {
    /// Concurrent transfers; tasks beyond this wait for a free slot
    pub max_handles: usize,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// How long idle pooled connections are kept
    pub pool_idle_timeout: Duration,

    /// Idle connections kept per host
    pub pool_max_idle_per_host: usize,

    /// Worker threads of the transfer runtime
    pub worker_threads: usize,

    /// User agent sent with every request
    pub user_agent: String,

    /// Backoff between attempts; `max_attempts` is overridden per task
    pub retry_policy: RetryPolicy,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_handles: 8,
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 8,
            worker_threads: 2,
            user_agent: concat!("superpack-protocol/", env!("CARGO_PKG_VERSION")).to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl DownloaderConfig {
    /// Create configuration from `SUPERPACK_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_handles: std::env::var("SUPERPACK_MAX_HANDLES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_handles),
            connect_timeout: Duration::from_secs(
                std::env::var("SUPERPACK_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
            worker_threads: std::env::var("SUPERPACK_WORKER_THREADS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.worker_threads),
            user_agent: std::env::var("SUPERPACK_USER_AGENT").unwrap_or(defaults.user_agent),
            retry_policy: RetryPolicy::from_env(),
            ..defaults
        }
    }

    #[must_use]
    pub fn with_max_handles(mut self, max_handles: usize) -> Self {
        self.max_handles = max_handles.max(1);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}
