//! Error types for jobtrail.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed lifecycle event: {0}")]
    MalformedEvent(String),

    #[error("invalid persisted state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
