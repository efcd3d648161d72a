//! Error types for vision projectors.

use thiserror::Error;

/// Main error type for projector construction and forward passes.
#[derive(Error, Debug)]
pub enum ProjectorError {
    /// `mm_projector_type` is not one of the known kinds.
    #[error("Unknown projector type: {0}")]
    UnknownProjectorType(String),

    /// Configuration errors (missing or inconsistent fields).
    #[error("Config error: {0}")]
    Config(String),

    /// The projector cannot consume this input layout.
    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    /// Output cardinality differs from the input batch size.
    #[error("Batch mismatch: expected {expected} outputs, got {actual}")]
    BatchMismatch { expected: usize, actual: usize },

    /// Branch assignment is missing or holds values other than 0/1.
    #[error("Invalid branch assignment: {0}")]
    InvalidAssignment(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for projector operations.
pub type ProjectorResult<T> = Result<T, ProjectorError>;
