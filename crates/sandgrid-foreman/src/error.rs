//! Error types for the foreman.

use thiserror::Error;

/// Result type alias for foreman operations.
pub type ForemanResult<T> = Result<T, ForemanError>;

#[derive(Debug, Error)]
pub enum ForemanError {
    /// The Task Store could not be reached.
    #[error("task store unreachable: {0}")]
    Http(String),

    /// The Task Store answered with a failure.
    #[error("task store refused ({status}): {message}")]
    Refused { status: u16, message: String },

    #[error("observer error: {0}")]
    Observer(#[from] sandgrid_observer::ObserverError),

    #[error("manifest error: {0}")]
    Core(#[from] sandgrid_core::CoreError),

    #[error("launch failed: {0}")]
    Launch(String),

    #[error("image cache error: {0}")]
    Image(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
