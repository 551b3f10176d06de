//! # Command Intake
//!
//! Admission control for tenant-scoped commands.
//!
//! - [`CommandIntake::submit`]: validate, route, gate and throttle a command,
//!   then write its outbox row and return immediately
//! - [`CommandIntake::execute_now`]: same admission, then forward the command
//!   synchronously to its target service behind a circuit breaker
//!
//! Rejections carry a stable [`RejectionCode`] and never write anything.

mod error;
mod forward;
mod intake;
mod routing;
mod validator;

pub use error::{AdmissionRejection, ForwardError, IntakeError, IntakeResult, RejectionCode};
pub use forward::{
    command_endpoint, ForwardRequest, ForwardResponse, ForwardTransport, HttpForwardTransport,
};
pub use intake::{
    payload_hash, Accepted, CommandIntake, IntakeConfig, SubmitCommand, COMMAND_NAME_HEADER,
    CORRELATION_ID_HEADER, INITIATED_BY_HEADER, PAYLOAD_HASH_HEADER, REQUEST_ID_HEADER,
    TENANT_ID_HEADER,
};
pub use routing::choose_route;
pub use validator::{PayloadValidator, RequiredFields, ValidatorRegistry};
