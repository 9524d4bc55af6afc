//! Error types for Cuantizar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Hessian is not positive definite (pivot {pivot:e} at index {index}); retry with a larger damp_fraction")]
    NotPositiveDefinite { index: usize, pivot: f64 },

    #[error("Invalid state: cannot {operation} while engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("No dequantization strategy registered for {0}")]
    MissingStrategy(String),

    #[error("Unknown layer: {0}")]
    UnknownLayer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, Error>;
