use std::future::Future;
use std::time::Duration;

use rand::Rng;

use storage::repository::StorageError;

/// Backoff policy for conflict-class storage failures.
///
/// Only `StorageError::Conflict` is retried; every other error propagates on
/// the first attempt. Conflicts are expected when rapid time updates race a
/// completion write on the same `(lesson, student)` key, so the backoff is a
/// recovery mechanism, not a prevention mechanism.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Policy that never sleeps between attempts (deterministic tests).
    #[must_use]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
        }
    }

    /// Total attempts this policy allows, counting the initial one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Exponential delay for a zero-based retry index, with up to 50% jitter.
    fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1_u32 << retry.min(16));
        if exp.is_zero() {
            return exp;
        }
        let half = u64::try_from(exp.as_millis() / 2).unwrap_or(u64::MAX);
        let jitter = rand::rng().random_range(0..=half);
        exp + Duration::from_millis(jitter)
    }

    /// Run `op`, retrying conflict-class failures with backoff.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-conflict error immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_conflict() && retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    tracing::debug!(retry, ?delay, "retrying conflicting write");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
