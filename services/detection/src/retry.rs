//! Bounded retry with linear backoff around backend calls.

use backoff::backoff::Backoff;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// All attempts failed; carries the last error unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Backoff schedule yielding `base`, `2 * base`, `3 * base`, ...
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    step: u32,
}

impl LinearBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base, step: 0 }
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.step = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.step = self.step.saturating_add(1);
        self.base.checked_mul(self.step)
    }
}

/// Retry policy for detection backend calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// `max_attempts` below 1 is treated as 1
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `attempt_fn` until it succeeds or `max_attempts` calls have failed.
    ///
    /// `attempt_fn` receives the 1-based attempt number. After failed attempt
    /// `i` the task sleeps `i * base_delay` unless no attempt remains.
    pub async fn call<T, E, F, Fut>(&self, mut attempt_fn: F) -> Result<T, RetryExhausted<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = LinearBackoff::new(self.base_delay);
        let mut attempt = 1;

        loop {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.base_delay);
                    warn!(
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
