//! Error types for diffusion training

use thiserror::Error;

/// Training errors
#[derive(Debug, Error)]
pub enum Error {
    /// Input the optimizer cannot handle, e.g. a sparse gradient
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    /// Caller and model disagree about something that must match
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Shape mismatch
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for training operations
pub type Result<T> = std::result::Result<T, Error>;
