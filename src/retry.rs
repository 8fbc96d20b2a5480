//! Attempt-counting retry loop shared by the fetch and assembly stages.
//!
//! Each stage hands [`retry`] a closure that performs exactly one attempt.
//! The helper owns the attempt counter, the backoff schedule and the
//! cancellation checkpoints, so the stages only decide what one attempt is.
//!
//! Cancellation is checked before every attempt and raced against every
//! backoff sleep. An attempt that has already started is never interrupted.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Delay schedule between consecutive attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    /// Same delay before every retry.
    Constant { delay_ms: u64 },
    /// `step_ms × retry_number`.
    Linear { step_ms: u64 },
    /// `base_ms × 2^(retry_number − 1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base_ms: 1000,
            max_ms: 30_000,
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let ms = match *self {
            Backoff::Constant { delay_ms } => delay_ms,
            Backoff::Linear { step_ms } => step_ms.saturating_mul(retry as u64),
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor).min(max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

/// Attempt budget plus backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

/// Per-error hints consulted by the retry loop.
pub trait RetryHint {
    /// Minimum delay the server asked for before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Value returned by a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    /// 1-based number of the attempt that succeeded.
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Failed attempts that preceded the success.
    pub fn retries(&self) -> u32 {
        self.attempts - 1
    }
}

/// Terminal outcome of a retry loop that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed; `last` is the final attempt's error.
    Exhausted { attempts: u32, last: E },
    /// Cancellation was observed at a checkpoint after `attempts` attempts.
    Cancelled { attempts: u32 },
}

/// Run `op` until it succeeds, the budget is spent, or `cancel` fires.
///
/// `op` receives the 1-based attempt number. `label` only feeds log lines.
pub async fn retry<T, E, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<Retried<T>, RetryError<E>>
where
    E: RetryHint + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(err) => err,
        };

        if attempt >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let mut delay = policy.backoff.delay(attempt);
        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint);
        }
        warn!(
            "{}: attempt {}/{} failed ({}), retrying in {}ms",
            label,
            attempt,
            policy.max_attempts,
            err,
            delay.as_millis()
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            _ = sleep(delay) => {}
        }
    }
}
