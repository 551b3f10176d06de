//! Intake error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable admission rejection codes returned to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    RouteNotFound,
    CommandDisabled,
    Throttled,
    ValidationFailed,
    /// Synchronous forwarding only: the target's circuit is open.
    CircuitOpen,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RouteNotFound => "ROUTE_NOT_FOUND",
            Self::CommandDisabled => "COMMAND_DISABLED",
            Self::Throttled => "THROTTLED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        }
    }

    /// Lowercase form used as a metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::RouteNotFound => "route_not_found",
            Self::CommandDisabled => "command_disabled",
            Self::Throttled => "throttled",
            Self::ValidationFailed => "validation_failed",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command was refused before anything was written.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AdmissionRejection {
    pub code: RejectionCode,
    pub message: String,
}

impl AdmissionRejection {
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Synchronous forwarding failure.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// No base URL is configured for the target service.
    #[error("No URL configured for service {0}")]
    UnknownService(String),

    /// The target answered with a server error.
    #[error("Service {service} returned {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },
}

/// Intake error type.
#[derive(Error, Debug)]
pub enum IntakeError {
    /// The command was refused; nothing was written.
    #[error("Command rejected: {0}")]
    Rejected(#[from] AdmissionRejection),

    #[error("Database error: {0}")]
    Database(#[from] dispatch_database::DatabaseError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] command_outbox::OutboxError),

    #[error("Forwarding failed: {0}")]
    Forward(#[from] ForwardError),

    /// `execute_now` was called on an intake built without a forwarder.
    #[error("Synchronous forwarding is not configured")]
    ForwardingDisabled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IntakeError {
    /// The rejection, if this error is an admission rejection.
    pub fn rejection(&self) -> Option<&AdmissionRejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            _ => None,
        }
    }

    pub fn rejection_code(&self) -> Option<RejectionCode> {
        self.rejection().map(|r| r.code)
    }
}

/// Result type alias using IntakeError.
pub type IntakeResult<T> = Result<T, IntakeError>;
