//! Error types for sandgrid core.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while parsing values, manifests and configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {kind} value: {value:?}")]
    Parse { kind: &'static str, value: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid manifest: {0}")]
    Manifest(String),
}

impl CoreError {
    pub(crate) fn parse(kind: &'static str, value: impl Into<String>) -> Self {
        CoreError::Parse {
            kind,
            value: value.into(),
        }
    }
}
