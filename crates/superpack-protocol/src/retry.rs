//! Retry policy with exponential backoff

use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first try
    pub max_attempts: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 30% jitter so parallel tasks do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create retry policy from `SUPERPACK_*` environment variables
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("SUPERPACK_MAX_RETRIES", 3),
            initial_backoff: Duration::from_millis(env_or("SUPERPACK_RETRY_BACKOFF", 100)),
            max_backoff: Duration::from_secs(env_or("SUPERPACK_MAX_BACKOFF", 10)),
            multiplier: env_or("SUPERPACK_BACKOFF_MULTIPLIER", 2.0),
            jitter: env_or("SUPERPACK_RETRY_JITTER", true),
        }
    }

    /// Policy that gives up after the first failure
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        #[allow(clippy::cast_possible_wrap)]
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent as i32);
        let mut delay = Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()));

        if self.jitter {
            let jitter = rng().random_range(0.0..0.3);
            #[allow(clippy::cast_precision_loss)]
            // Precision loss is acceptable for jitter calculation
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay += Duration::from_millis(jitter_ms);
        }
        delay
    }

    /// Execute a function with retry logic
    pub async fn execute<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.should_retry() || attempt >= self.max_attempts => {
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!("Attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::significant_drop_tightening
)]
mod tests {
    use super::*;
    use crate::error::DownloadError;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(policy.jitter);
    }

    #[test]
    fn test_from_env_custom_values() {
        unsafe {
            std::env::set_var("SUPERPACK_MAX_RETRIES", "5");
            std::env::set_var("SUPERPACK_RETRY_BACKOFF", "200");
            std::env::set_var("SUPERPACK_MAX_BACKOFF", "20");
            std::env::set_var("SUPERPACK_BACKOFF_MULTIPLIER", "1.5");
            std::env::set_var("SUPERPACK_RETRY_JITTER", "false");
        }

        let policy = RetryPolicy::from_env();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(200));
        assert_eq!(policy.max_backoff, Duration::from_secs(20));
        assert!((policy.multiplier - 1.5).abs() < f64::EPSILON);
        assert!(!policy.jitter);

        unsafe {
            for var in [
                "SUPERPACK_MAX_RETRIES",
                "SUPERPACK_RETRY_BACKOFF",
                "SUPERPACK_MAX_BACKOFF",
                "SUPERPACK_BACKOFF_MULTIPLIER",
                "SUPERPACK_RETRY_JITTER",
            ] {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::default()
            .with_jitter(false)
            .with_initial_backoff(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(131));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let policy = RetryPolicy::default()
            .with_jitter(false)
            .with_initial_backoff(Duration::from_millis(1));
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let result = policy
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let mut calls = counter.lock().unwrap();
                    *calls += 1;
                    if *calls < 3 {
                        Err(DownloadError::Timeout)
                    } else {
                        Ok(*calls)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("Operation should succeed"), 3);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let policy = RetryPolicy::default().with_initial_backoff(Duration::from_millis(1));
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<()> = policy
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock().unwrap() += 1;
                    Err(DownloadError::RangeNotSupported)
                }
            })
            .await;

        assert!(matches!(result, Err(DownloadError::RangeNotSupported)));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let policy = RetryPolicy::no_retry()
            .with_max_attempts(2)
            .with_initial_backoff(Duration::from_millis(1));
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<()> = policy
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    *counter.lock().unwrap() += 1;
                    Err(DownloadError::Timeout)
                }
            })
            .await;

        assert!(matches!(result, Err(DownloadError::Timeout)));
        assert_eq!(*calls.lock().unwrap(), 3);
    }
}
