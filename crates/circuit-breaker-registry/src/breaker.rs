//! Single-target circuit breaker.

use crate::CircuitBreakerError;
use dispatch_config_and_utils::{metrics, CircuitBreakerSettings};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitTransition {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: u32,
}

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(30_000),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(settings.reset_timeout_ms),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// When the current HALF_OPEN trial call was admitted.
    trial_started_at: Option<Instant>,
}

/// How a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Reopens the circuit if a trial call's future is dropped before it reports.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial_at(Instant::now());
        }
    }
}

/// Circuit breaker for one target.
///
/// All methods take `&self`; state lives behind a short-held mutex.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    /// Create a standalone breaker with its own transition channel.
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self::with_events(target, config, events)
    }

    pub(crate) fn with_events(
        target: impl Into<String>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<CircuitTransition>,
    ) -> Self {
        Self {
            target: target.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_started_at: None,
            }),
            events,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Subscribe to this breaker's transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.events.subscribe()
    }

    /// Whether a call may proceed now.
    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    /// Whether a call may proceed at `now`.
    ///
    /// The first caller after the reset timeout moves the breaker to
    /// HALF_OPEN and becomes the trial call. A trial call that has not reported
    /// within another reset timeout is presumed lost and replaced.
    pub fn allow_request_at(&self, now: Instant) -> bool {
        self.admit_at(now).is_some()
    }

    fn admit_at(&self, now: Instant) -> Option<Admission> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen => {
                let trial_age = inner
                    .trial_started_at
                    .map(|started| now.saturating_duration_since(started))
                    .unwrap_or(self.config.reset_timeout);
                if trial_age >= self.config.reset_timeout {
                    debug!(target_name = %self.target, "Replacing stale half-open trial call");
                    inner.trial_started_at = Some(now);
                    Some(Admission::Trial)
                } else {
                    None
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or(self.config.reset_timeout);
                if elapsed >= self.config.reset_timeout {
                    inner.trial_started_at = Some(now);
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    Some(Admission::Trial)
                } else {
                    None
                }
            }
        }
    }

    /// A trial call went away without reporting; wait a full reset timeout again.
    fn abandon_trial_at(&self, now: Instant) {
        let mut inner = self.lock();
        if inner.state != CircuitState::HalfOpen {
            return;
        }
        inner.opened_at = Some(now);
        inner.trial_started_at = None;
        debug!(target_name = %self.target, "Half-open trial call cancelled");
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Report a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_started_at = None;
                self.transition(&mut inner, CircuitState::Closed);
            }
            // Late result from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    /// Report a failed call.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// Report a failed call observed at `now`.
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(now);
                inner.trial_started_at = None;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails fast with [`CircuitBreakerError::Open`] when the call is not
    /// allowed; otherwise records the outcome.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit_at(Instant::now()) else {
            return Err(CircuitBreakerError::Open {
                target: self.target.clone(),
            });
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let outcome = operation().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        let event = CircuitTransition {
            target: self.target.clone(),
            from,
            to,
            consecutive_failures: inner.consecutive_failures,
        };

        if to == CircuitState::Open {
            warn!(
                target_name = %event.target,
                from = %from,
                to = %to,
                consecutive_failures = event.consecutive_failures,
                "Circuit opened"
            );
        } else {
            info!(
                target_name = %event.target,
                from = %from,
                to = %to,
                consecutive_failures = event.consecutive_failures,
                "Circuit state changed"
            );
        }
        metrics::record_circuit_transition(&event.target, from.as_str(), to.as_str());

        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
