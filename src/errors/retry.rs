use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed { delay: Duration },
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s): {source}")]
pub struct RetryExhausted<E> {
    pub operation: String,
    pub attempts: u32,
    #[source]
    pub source: E,
}

/// Bounded retry shared by every hypervisor step that is allowed to retry.
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

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed { delay })
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Runs `op` until it succeeds, returns an error `is_retryable` rejects,
    /// or the attempt ceiling is reached.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation, attempts = attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !is_retryable(&err) {
                        warn!(
                            operation,
                            error = err.to_string(),
                            attempts = attempt,
                            "Giving up"
                        );
                        return Err(RetryExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = self.backoff.delay_after(attempt);
                    warn!(
                        operation,
                        error = err.to_string(),
                        retry_count = attempt,
                        max_retries = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(5))
    }
}
