//! Bounded exponential backoff.
//!
//! Retries are a small state machine ([`Backoff`]) rather than recursive
//! callbacks: each failed attempt asks the machine for the next delay and
//! stops once the attempt budget is spent.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeps, for tests and local fakes.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            failures: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn attempts(&self) -> u32 {
        self.failures
    }

    /// Records one failed attempt and returns the wait before the next, or
    /// `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts.max(1) {
            return None;
        }

        let exponent = (self.failures - 1).min(16);
        let delay = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.policy.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
pub async fn with_backoff<T, E, F, Fut, R>(
    policy: RetryPolicy,
    label: &str,
    mut operation: F,
    is_retryable: R,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut backoff = policy.backoff();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retryable = is_retryable(&error);
                let delay = if retryable { backoff.next_delay() } else { None };
                match delay {
                    Some(delay) => {
                        warn!(
                            operation = label,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "retrying after failure"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    None => {
                        let attempts = if retryable {
                            backoff.attempts()
                        } else {
                            backoff.attempts() + 1
                        };
                        return Err(Exhausted {
                            attempts,
                            last_error: error,
                        });
                    }
                }
            }
        }
    }
}
