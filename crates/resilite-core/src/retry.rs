//! Retry with backoff
//!
//! One policy type drives every retry loop in the layer: reconnects use
//! exponential backoff, transactions use linear backoff, and bootstrap opens
//! reuse the reconnect policy.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * multiplier^(attempt - 1)`
    Exponential { multiplier: f64 },
    /// Always `base_delay`
    Fixed,
}

/// Retry policy parameterized by attempts, base delay and growth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Randomize each delay by up to +/- this fraction (0.0 disables)
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Exponential { multiplier },
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential { multiplier } => {
                let factor = multiplier.powi(attempt as i32 - 1);
                if factor.is_finite() && factor * self.base_delay.as_secs_f64() < self.max_delay.as_secs_f64() {
                    self.base_delay.mul_f64(factor)
                } else {
                    self.max_delay
                }
            }
            Backoff::Fixed => self.base_delay,
        };
        let delay = if self.jitter > 0.0 {
            delay.mul_f64(1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0))
        } else {
            delay
        };
        delay.min(self.max_delay)
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts actually made
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. `should_retry` decides whether a
/// given error is worth another attempt; returning `false` stops immediately.
pub fn retry_with<T, E, F, R>(policy: &RetryPolicy, mut op: F, mut should_retry: R) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    R: FnMut(&E, u32) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(err) => {
                if attempt >= max_attempts || !should_retry(&err, attempt) {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after failure"
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Retry every error until the policy is exhausted
pub fn retry<T, E, F>(policy: &RetryPolicy, op: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
{
    retry_with(policy, op, |_, _| true)
}
