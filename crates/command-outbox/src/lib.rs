//! Transactional outbox for command dispatch.
//!
//! This crate provides:
//! - OutboxStore: claim/mark operations over the durable outbox table
//! - Broker: publish abstraction, with Redis Streams and in-memory backends
//! - OutboxDispatcher: the claim loop that publishes rows with backoff and
//!   dead-lettering

mod broker;
mod dispatcher;
mod error;
mod store;

#[cfg(test)]
mod tests;

pub use broker::{
    partition_for, Broker, BrokerMessage, InMemoryBroker, RedisStreamBroker, EVENT_ID_HEADER,
    LAST_ERROR_HEADER, RETRY_COUNT_HEADER,
};
pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use error::{BrokerError, BrokerResult, OutboxError, OutboxResult};
pub use store::OutboxStore;

/// Counts for one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead: usize,
    /// Rows whose claim was taken over by another dispatcher mid-delivery.
    pub lost_claims: usize,
    /// Rows handed back unattempted: on shutdown, or held behind an
    /// undelivered row of their partition.
    pub released: usize,
}
