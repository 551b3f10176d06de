//! Circuit breaker error types.

use thiserror::Error;

/// Error returned by [`crate::CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open (or a half-open trial call is already in flight).
    #[error("circuit open for {target}")]
    Open { target: String },

    /// The guarded call ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Result type alias using CircuitBreakerError.
pub type CircuitBreakerResult<T, E> = Result<T, CircuitBreakerError<E>>;
