//! Bounded retry with decorrelated jitter for transient service failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use super::ServiceError;

/// Bounds applied to a retried operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts; subsequent delays are drawn uniformly
    /// from the decorrelated range `[base, previous * 3]`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and base delay.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Runs `operation` until it succeeds or the attempt budget is exhausted.
///
/// Every failure is retried; the final failure is re-raised unchanged. The
/// delay between attempts follows the decorrelated-jitter scheme: each delay
/// is drawn uniformly between the base delay and three times the previous
/// delay.
///
/// # Errors
///
/// Returns the last [`ServiceError`] produced by `operation` once
/// `policy.max_attempts` attempts have failed.
pub async fn retry_with_jitter<T, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let base_ms = u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX);
    let mut delay_ms = base_ms;
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let upper = delay_ms.saturating_mul(3).max(base_ms);
                delay_ms = rand::thread_rng().gen_range(base_ms..=upper);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms,
                    error = %err,
                    "retrying transient service failure"
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}
