//! Error types for switchyard

use thiserror::Error;

/// Main error type for switchyard
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Key-value store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Unknown ticket provider type: {0}")]
    UnknownProvider(String),

    #[error("Ticket provider error: {0}")]
    Provider(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for switchyard
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the failed operation could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(_) | Error::Kv(_) | Error::Http(_) => true,
            Error::Provider(_) => true,
            _ => false,
        }
    }
}
