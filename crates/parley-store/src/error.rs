use parley_shared::ValidationError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Unknown message or user.
    #[error("{0} not found")]
    NotFound(String),

    /// The acting user does not own the record.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Input rejected before any write.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Uniqueness violated (e.g. duplicate username).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Reading or writing the document failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding the document failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background write task panicked or was cancelled.
    #[error("Write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ValidationError> for StoreError {
    fn from(e: ValidationError) -> Self {
        StoreError::Validation(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
