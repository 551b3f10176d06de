//! SQLite persistence for the command dispatch pipeline.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread
//! - Schema migrations
//! - Model types for the outbox, command routes and command features
//! - Standalone query functions, including the atomic outbox claim
//!
//! All timestamps are stored as epoch milliseconds. Query functions that
//! depend on the clock take `now_ms` explicitly.
//!
//! ```ignore
//! let db = AsyncDatabase::open(path).await?;
//! let claimed = db
//!     .call(move |conn| queries::claim_outbox_batch(conn, 50, 60_000, "worker-1", now_ms))
//!     .await?;
//! ```

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::run_migrations;
pub use models::*;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
