//! Error type shared across the workspace.

use thiserror::Error;

/// Errors raised by pairgate components.
#[derive(Debug, Error)]
pub enum PairgateError {
    #[error("config error: {0}")]
    Config(String),

    #[error("memory error: {0}")]
    Memory(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
