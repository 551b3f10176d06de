//! Dispatch pipeline metrics.
//!
//! Metric names and recording helpers shared by intake, dispatcher and the
//! circuit breaker registry. Emitted through the `metrics` facade; without an
//! installed recorder every call is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Metric Names
// ============================================================================

/// Admission decisions, labelled by `outcome`.
pub const ADMISSIONS: &str = "command_dispatch_admissions_total";

/// Delivery attempts, labelled by `outcome` (delivered, retried, dead).
pub const DISPATCHES: &str = "command_dispatch_dispatches_total";

/// Rows claimed per poll.
pub const CLAIM_BATCH_SIZE: &str = "command_dispatch_claim_batch_size";

/// Time spent waiting on the tenant publish throttler.
pub const PUBLISH_THROTTLE_WAIT: &str = "command_dispatch_publish_throttle_wait_seconds";

/// Circuit breaker state transitions, labelled by `target`, `from`, `to`.
pub const CIRCUIT_TRANSITIONS: &str = "command_dispatch_circuit_transitions_total";

/// Synchronous forwarding calls, labelled by `target` and `result`.
pub const FORWARD_CALLS: &str = "command_dispatch_forward_calls_total";

/// Dispatcher loop errors (claim or store failures).
pub const DISPATCHER_ERRORS: &str = "command_dispatch_dispatcher_errors_total";

// ============================================================================
// Label Values
// ============================================================================

/// Label values used across metrics.
pub mod labels {
    pub const ACCEPTED: &str = "accepted";
    pub const DEDUPLICATED: &str = "deduplicated";
    pub const OBSERVED: &str = "observed";
    pub const UNVALIDATED: &str = "unvalidated";

    pub const DELIVERED: &str = "delivered";
    pub const RETRIED: &str = "retried";
    pub const DEAD: &str = "dead";

    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
    pub const REJECTED: &str = "rejected";
}

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers metric descriptions.
///
/// Call once at startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(ADMISSIONS, "Command admission decisions by outcome");
    describe_counter!(DISPATCHES, "Outbox delivery attempts by outcome");
    describe_histogram!(CLAIM_BATCH_SIZE, "Rows claimed per dispatcher poll");
    describe_histogram!(
        PUBLISH_THROTTLE_WAIT,
        "Seconds spent in the tenant publish throttler"
    );
    describe_counter!(CIRCUIT_TRANSITIONS, "Circuit breaker state transitions");
    describe_counter!(FORWARD_CALLS, "Synchronous forwarding calls by result");
    describe_counter!(DISPATCHER_ERRORS, "Dispatcher loop errors");
}

// ============================================================================
// Recording
// ============================================================================

/// Records an admission decision. `outcome` is a label value or a rejection code.
pub fn record_admission(command: &str, outcome: &str) {
    counter!(
        ADMISSIONS,
        "command" => command.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Records the outcome of one delivery attempt.
pub fn record_dispatch(topic: &str, outcome: &str) {
    counter!(
        DISPATCHES,
        "topic" => topic.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Records the size of a claimed batch.
pub fn record_claim_batch(size: usize) {
    histogram!(CLAIM_BATCH_SIZE).record(size as f64);
}

/// Records time spent in the publish throttler.
pub fn record_publish_throttle_wait(wait_ms: u64) {
    histogram!(PUBLISH_THROTTLE_WAIT).record(wait_ms as f64 / 1000.0);
}

/// Records a circuit breaker transition.
pub fn record_circuit_transition(target: &str, from: &str, to: &str) {
    counter!(
        CIRCUIT_TRANSITIONS,
        "target" => target.to_string(),
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Records a synchronous forwarding call.
pub fn record_forward_call(target: &str, result: &str) {
    counter!(
        FORWARD_CALLS,
        "target" => target.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Records a dispatcher loop error.
pub fn record_dispatcher_error(stage: &str) {
    counter!(DISPATCHER_ERRORS, "stage" => stage.to_string()).increment(1);
}
