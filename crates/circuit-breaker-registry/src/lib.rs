//! Circuit breakers for synchronous calls to downstream services.
//!
//! # States
//!
//! ```text
//! CLOSED    --(consecutive failures >= threshold)--> OPEN
//! OPEN      --(reset timeout elapsed, first caller)--> HALF_OPEN
//! HALF_OPEN --(trial call succeeds)--> CLOSED
//! HALF_OPEN --(trial call fails)--> OPEN
//! ```
//!
//! While HALF_OPEN exactly one trial call is in flight; every other caller is
//! denied until the trial call reports back.
//!
//! Breakers are process-local. The [`CircuitBreakerRegistry`] creates one per
//! target on first use and publishes every state change as a
//! [`CircuitTransition`] on a broadcast channel.

mod breaker;
mod error;
mod registry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitTransition};
pub use error::{CircuitBreakerError, CircuitBreakerResult};
pub use registry::CircuitBreakerRegistry;
