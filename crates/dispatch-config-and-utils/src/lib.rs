//! Core configuration and utilities for the command dispatch pipeline.

mod config;
mod error;
mod logging;
pub mod metrics;
mod paths;

pub use config::{
    BrokerConfig, BrokerKind, CircuitBreakerSettings, Config, DispatcherSettings, IntakeSettings,
    PublishThrottleSettings, RetrySettings, DEFAULT_ENVIRONMENT, DEFAULT_LOG_LEVEL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
