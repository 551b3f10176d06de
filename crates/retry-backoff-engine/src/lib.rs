//! # Retry/Backoff Engine
//!
//! Bounded retry executor shared by the command dispatch pipeline.
//!
//! ## Delay policy
//!
//! The delay before retry number `attempt` (0-based) is either taken from a
//! fixed schedule or grows exponentially:
//!
//! - schedule: `schedule[min(attempt, len - 1)]`
//! - exponential: `base_delay_ms * 2^attempt`
//!
//! A uniform jitter in `[0, delay * jitter_factor]` is added on top. With
//! `base = 100ms` and no jitter the delays are 100ms, 200ms, 400ms, ...
//!
//! ## Usage
//!
//! [`run`] executes an async operation until it succeeds or `max_retries`
//! retries have been spent, sleeping between attempts. The same policy is
//! used by the outbox dispatcher to compute `available_at` for a failed
//! delivery without sleeping, see [`RetryPolicy::next_available_at`].
//!
//! ```ignore
//! let policy = RetryPolicy::exponential(3, 100);
//! let value = run(&policy, |attempt| async move { call(attempt).await }, |n, delay, err| {
//!     warn!(retry = n, ?delay, %err, "retrying");
//! })
//! .await?;
//! ```

use dispatch_config_and_utils::RetrySettings;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// The operation failed on every attempt.
#[derive(Debug, Error)]
#[error("retry exhausted after {attempts} attempts: {last_error}")]
pub struct RetryExhausted<E> {
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// Error returned by the final attempt.
    pub last_error: E,
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_delay_ms: u64,
    /// Fixed delays; overrides exponential backoff when present and non-empty.
    pub delay_schedule_ms: Option<Vec<u64>>,
    /// Jitter as a fraction of the computed delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay_ms: settings.base_delay_ms,
            delay_schedule_ms: settings.delay_schedule_ms.clone(),
            jitter_factor: settings.jitter_factor,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff without jitter.
    pub fn exponential(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            delay_schedule_ms: None,
            jitter_factor: 0.0,
        }
    }

    /// Fixed delay schedule without jitter. The last entry repeats.
    pub fn scheduled(max_retries: u32, delay_schedule_ms: Vec<u64>) -> Self {
        Self {
            max_retries,
            base_delay_ms: 0,
            delay_schedule_ms: Some(delay_schedule_ms),
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay before retry `attempt` (0-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> u64 {
        if let Some(schedule) = self.delay_schedule_ms.as_deref().filter(|s| !s.is_empty()) {
            let idx = (attempt as usize).min(schedule.len() - 1);
            return schedule[idx];
        }

        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        self.base_delay_ms.saturating_mul(multiplier)
    }

    /// Delay before retry `attempt` (0-based), with jitter drawn from `rng`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(attempt);
        let max_jitter = (base as f64 * self.jitter_factor.max(0.0)).floor() as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rng.gen_range(0..=max_jitter)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }

    /// Delay before retry `attempt` (0-based), with jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// Epoch-ms timestamp at which retry `attempt` becomes due.
    pub fn next_available_at(&self, now_ms: i64, attempt: u32) -> i64 {
        let delay = self.delay_for(attempt).as_millis().min(i64::MAX as u128) as i64;
        now_ms.saturating_add(delay)
    }
}

/// Run `operation` until it succeeds or the retry budget is spent.
///
/// `operation` receives the 0-based attempt number. Before each retry,
/// `on_retry(retry_number, delay, &error)` is called with the 1-based
/// number of the retry about to run, then the task sleeps for `delay`.
pub async fn run<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut operation: F,
    mut on_retry: R,
) -> Result<T, RetryExhausted<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(u32, Duration, &E),
{
    let mut attempt: u32 = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt >= policy.max_retries {
                    warn!(
                        attempts = attempt + 1,
                        error = %err,
                        "Retry budget exhausted"
                    );
                    return Err(RetryExhausted {
                        attempts: attempt + 1,
                        last_error: err,
                    });
                }

                let delay = policy.delay_for(attempt);
                on_retry(attempt + 1, delay, &err);
                debug!(
                    retry = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
