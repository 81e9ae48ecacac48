//! Retry logic for transient remote-transfer failures
//!
//! Database connectivity failures are deliberately not routed through here: a
//! backup that cannot reach its target fails and the caller re-invokes.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Add jitter so parallel pipelines do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts; for tests
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Retry executor
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Executor for `config`
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Active policy
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with an error `is_retryable`
    /// rejects, or the attempt budget is spent. The last error is returned.
    #[instrument(skip(self, operation, is_retryable))]
    pub async fn execute<F, Fut, T, E, R>(
        &self,
        label: &str,
        mut operation: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        info!("{} succeeded after {} attempts", label, attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !is_retryable(&error) {
                        return Err(error);
                    }
                    if attempt >= self.config.max_attempts.max(1) {
                        error!("{} failed after {} attempts: {}", label, attempt, error);
                        return Err(error);
                    }

                    warn!("{} attempt {} failed: {}, retrying in {:?}", label, attempt, error, delay);

                    let actual_delay = if self.config.jitter {
                        let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
                        delay + Duration::from_millis(jitter_ms)
                    } else {
                        delay
                    };

                    tokio::time::sleep(actual_delay).await;

                    delay = Duration::from_millis(
                        (delay.as_millis() as f64 * self.config.backoff_multiplier) as u64,
                    )
                    .min(self.config.max_delay);
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_until_success() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        let counter = Arc::new(AtomicUsize::new(0));
        let result = executor
            .execute(
                "upload",
                || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(std::io::Error::new(std::io::ErrorKind::Other, "reset"))
                        } else {
                            Ok(42)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let executor = RetryExecutor::new(RetryConfig::immediate(5));
        let counter = Arc::new(AtomicUsize::new(0));

        let result: Result<(), std::io::Error> = executor
            .execute(
                "upload",
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
                    }
                },
                |e| e.kind() != std::io::ErrorKind::PermissionDenied,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let executor = RetryExecutor::new(RetryConfig::immediate(3));
        let counter = Arc::new(AtomicUsize::new(0));

        let result: Result<(), std::io::Error> = executor
            .execute(
                "download",
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout"))
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::TimedOut);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
