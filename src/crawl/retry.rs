//! Retry policy shared by the listing and download stages.
//!
//! A policy is an attempt budget plus a backoff function of the attempt number
//! that just failed. Attempts are numbered from 1.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Default attempt budget for report downloads.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff step: 10s after the first failure, 20s after the second.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(10);

/// Delay applied after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `step × attempt`
    Linear(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(step) => step.saturating_mul(attempt.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy that never retries.
    pub fn single_attempt() -> Self {
        Self::new(1, Backoff::None)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Run `operation` until it succeeds, returns an error `is_retryable`
    /// rejects, or the budget is spent. The last error is returned.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable(&err) && self.allows_retry_after(attempt) => {
                    let delay = self.delay_after(attempt);
                    log::warn!(
                        "attempt {attempt}/{} failed: {err}; retrying in {:.1}s",
                        self.max_attempts,
                        delay.as_secs_f64()
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Backoff::Linear(DEFAULT_BACKOFF_STEP))
    }
}
