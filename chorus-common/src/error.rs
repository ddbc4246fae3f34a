//! Common error types for Chorus

use thiserror::Error;

/// Common result type for Chorus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across Chorus workers
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input or malformed stored data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Message bus publish/consume error
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Model training failed; the message is also recorded on the model record
    #[error("Training failed: {0}")]
    Training(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
