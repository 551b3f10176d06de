//! Errors raised while loading configuration and resolving paths.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A setting is out of range or inconsistent with another.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A `services` entry is not a valid base URL.
    #[error("Invalid service URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cannot resolve base directory: {0}")]
    Path(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
