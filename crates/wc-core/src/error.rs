//! Error types for wcfit

use thiserror::Error;

/// wcfit error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error: mismatched lengths, bad bounds, unknown layout.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Precondition violation: an operation was called before its inputs were built,
    /// or an index is out of range.
    #[error("State error: {0}")]
    State(String),

    /// Numerical degeneracy (NaN objective, zero attenuation length, ...).
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
