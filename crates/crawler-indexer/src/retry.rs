use crawler_common::Result;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Defaults for RPC calls: 5 attempts, 0.5s doubling up to 30s
    pub const RPC: Self = Self::new(5, Duration::from_millis(500), Duration::from_secs(30));

    /// Defaults for storage commits: brief, since a dead database will not come back quickly
    pub const STORAGE: Self = Self::new(3, Duration::from_millis(200), Duration::from_secs(2));

    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    /// Delay before retry number `retry` (0 = the first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted. The last error is returned on exhaustion.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded after {} attempts", what, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt - 1);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {}ms...",
                    what,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!("{} failed after {} attempts: {}", what, attempt, e);
                }
                return Err(e);
            }
        }
    }
}
