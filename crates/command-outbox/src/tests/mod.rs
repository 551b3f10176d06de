//! Integration tests for the outbox dispatcher.
//!
//! - `harness.rs`     - In-memory database, in-memory broker and helpers
//! - `delivery.rs`    - Delivery envelope, ordering, publish spacing
//! - `claiming.rs`    - Claim exclusivity and crash recovery
//! - `dead_letter.rs` - Backoff, exhaustion and broker outages
//! - `shutdown.rs`    - Loop shutdown and claim release

mod delivery;
pub(crate) mod harness;
mod shutdown;
