//! Database errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The executor thread is gone or refused the call.
    #[error("Database executor unavailable: {0}")]
    Connection(String),

    /// A row expected to exist (usually just written) could not be read back.
    #[error("Row not found: {0}")]
    NotFound(String),

    /// An insert reused an event id that belongs to another row.
    #[error("Duplicate outbox event id: {0}")]
    DuplicateEventId(String),

    #[error("Stored JSON is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
