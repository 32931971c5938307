//! Retry with exponential backoff, shared by the model client and the
//! email dispatcher.
//!
//! A [`RetryPolicy`] is parameterized by the total number of attempts, the
//! base delay and a predicate deciding which errors are worth another try.
//! Errors that know their own retryability implement [`Retryable`] and can
//! use [`RetryPolicy::run`] directly.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first call. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }

    /// One initial call plus three retries, 1s doubling up to 10s.
    pub const fn model_default() -> Self {
        Self::new(4, Duration::from_secs(1))
    }

    /// One initial call plus two retries, 500ms doubling.
    pub const fn delivery_default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }

    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    fn attempts_allowed(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before the retry that follows the 0-indexed `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let base = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || base.is_zero() {
            return base;
        }
        // up to 25% extra
        let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    pub async fn run<F, Fut, T, E>(&self, operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        self.run_with(operation, E::is_retryable).await
    }

    pub async fn run_with<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let start = Instant::now();
        let max_attempts = self.attempts_allowed();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(attempts, "operation succeeded after retries");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        elapsed: start.elapsed(),
                    };
                }
                Err(err) => {
                    if !is_retryable(&err) {
                        tracing::debug!(attempts, error = %err, "non-retryable failure");
                        return RetryOutcome {
                            result: Err(err),
                            attempts,
                            elapsed: start.elapsed(),
                        };
                    }
                    if attempts >= max_attempts {
                        tracing::warn!(
                            attempts,
                            max_attempts,
                            error = %err,
                            "retries exhausted"
                        );
                        return RetryOutcome {
                            result: Err(err),
                            attempts,
                            elapsed: start.elapsed(),
                        };
                    }

                    let delay = self.delay_for_attempt(attempts - 1);
                    tracing::warn!(
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::model_default()
    }
}
