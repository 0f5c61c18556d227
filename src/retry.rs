//! Bounded retry with exponential backoff and a per-attempt timeout.
//! Shared by price source calls, comparator calls and alert delivery.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            base_delay,
            attempt_timeout,
        }
    }

    /// Backoff applied after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Run `f` until it succeeds, returns a non-retriable error, or the attempt
/// budget is spent. Each attempt is bounded by `attempt_timeout`.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.attempt_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(policy.attempt_timeout.as_millis() as u64)),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && e.is_retriable() => {
                let backoff = policy.backoff_after(attempt);
                warn!(
                    label,
                    attempt,
                    max_attempts,
                    "{label} failed (attempt {attempt}/{max_attempts}): {e}. Retrying in {}ms",
                    backoff.as_millis(),
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
