//! Error types for the sandgrid task store.

use thiserror::Error;

/// Result type alias for task store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during task store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A submitted task or result failed validation.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The task is assigned to someone else.
    #[error("forbidden: {0}")]
    Forbidden(String),
}
