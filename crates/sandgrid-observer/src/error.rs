//! Error types for the observer.

use thiserror::Error;

/// Result type alias for observer operations.
pub type ObserverResult<T> = Result<T, ObserverError>;

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session already closed: {0}")]
    Closed(String),

    #[error("invalid session secret")]
    Unauthorized,

    /// A caller broke a coordination rule, e.g. attached a pid owned by
    /// another session.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("control group unavailable: {0}")]
    Unavailable(String),

    #[error("malformed request: {0}")]
    Protocol(String),

    /// The observer answered with a failure status.
    #[error("observer refused: {0}")]
    Remote(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
