//! Bounded retry for blocking archive operations

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::StorageError;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `base_delay`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Run `op` on the blocking pool until it succeeds, fails with a
/// non-retryable error, or `policy.max_attempts` is reached.
///
/// `on_retry` is called before each backoff sleep.
pub async fn retry_blocking<T, F>(
    policy: RetryPolicy,
    operation: &'static str,
    op: F,
    on_retry: impl Fn(u32, &StorageError),
) -> Result<T>
where
    F: Fn() -> Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let op = Arc::new(op);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let task = Arc::clone(&op);
        let result = tokio::task::spawn_blocking(move || task())
            .await
            .map_err(|e| StorageError::Worker(e.to_string()))?;

        match result {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                return Err(StorageError::RetriesExhausted {
                    attempts: attempt,
                    last: err.to_string(),
                })
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Archive write failed, retrying"
                );
                on_retry(attempt, &err);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
