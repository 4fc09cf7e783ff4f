//! Bounded retry policy shared by every RPC call site.

use std::future::Future;
use std::time::Duration;

use fpmm_data::FetchError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delay between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`.
    Exponential(Duration),
}

impl Backoff {
    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential(base) => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: FetchError },
    #[error("permanent failure after {attempts} attempt(s): {error}")]
    Permanent { attempts: u32, error: FetchError },
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Permanent { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails permanently or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Cancellation is observed
    /// while waiting between attempts, never in the middle of a call.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.is_permanent() {
                return Err(RetryError::Permanent {
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                call = label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                rate_limited = error.is_rate_limited(),
                error = %error,
                "retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
