//! Retry utilities with exponential backoff.

use std::future::Future;
use std::time::Duration;

use crate::constants::{BACKOFF_BASE_SECS, MAX_RETRY_DELAY_SECS};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(BACKOFF_BASE_SECS),
            max_delay: Duration::from_secs(MAX_RETRY_DELAY_SECS),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
        }
    }
}

/// Exponential backoff state for one failing resource.
///
/// The first failure waits `base`, each following one doubles the wait up to
/// `max`. A success resets the sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(BACKOFF_BASE_SECS),
            Duration::from_secs(MAX_RETRY_DELAY_SECS),
        )
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        delay_for_attempt(self.base, self.max, self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Delay before retry number `attempt` (1-based).
pub fn delay_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    // 2^31 seconds is far beyond any cap, stop shifting before overflow
    let exponent = (attempt - 1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Execute an async operation with exponential backoff retry.
///
/// The operation is retried up to `config.max_retries` times, with exponentially
/// increasing delays between attempts (capped at `config.max_delay`).
///
/// Returns the result of the first successful attempt, or the last error if all
/// retries are exhausted.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config.initial_delay, config.max_delay);

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if backoff.attempts() >= config.max_retries {
                    return Err(e);
                }
                let delay = backoff.next_delay();

                tracing::warn!(
                    "Operation failed (attempt {}/{}): {}. Retrying in {:?}...",
                    backoff.attempts(),
                    config.max_retries + 1,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
