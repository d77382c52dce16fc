//! Error types for the incremental SQL source.

use thiserror::Error;

/// Result type alias for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors that can occur while extracting rows or persisting watermarks.
#[derive(Error, Debug)]
pub enum SourceError {
    /// Missing or inconsistent configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Indicator value could not be normalized into an integer position
    #[error("Invalid watermark value for table {table}: {value:?}")]
    InvalidWatermarkValue { table: String, value: String },

    /// Watermark position cannot be bound as a query parameter
    #[error("Invalid position {position} for table {table}: {reason}")]
    InvalidPosition {
        table: String,
        position: i64,
        reason: String,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Session is not open
    #[error("Not connected")]
    NotConnected,

    /// Checkpoint file could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Downstream sink rejected the records
    #[error("Sink error: {0}")]
    Sink(String),
}

impl SourceError {
    pub fn config(message: impl Into<String>) -> Self {
        SourceError::Config(message.into())
    }
}
