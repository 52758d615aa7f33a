//! Error types for the limits service.

use thiserror::Error;

use crate::scoreboard::ScoreboardError;

/// Main error type for limits operations.
#[derive(Error, Debug)]
pub enum LimitsError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A directive argument that could not be parsed
    #[error("{directive}: {message}")]
    Directive {
        directive: String,
        message: String,
    },

    /// Scoreboard errors
    #[error("Scoreboard error: {0}")]
    Scoreboard(#[from] ScoreboardError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for LimitsError {
    fn from(err: config::ConfigError) -> Self {
        LimitsError::Config(err.to_string())
    }
}

/// Result type alias for limits operations.
pub type Result<T> = std::result::Result<T, LimitsError>;
