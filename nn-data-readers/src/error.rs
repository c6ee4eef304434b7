//! Error types for dataset archives

use thiserror::Error;

/// Error type for dataset archives
#[derive(Error, Debug)]
pub enum Error {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] nn_data_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Malformed archive
    #[error("Format error: {0}")]
    Format(String),

    /// Requested dataset is not in the archive
    #[error("Dataset not found: {0}")]
    NotFound(String),
}

/// Result type for dataset archives
pub type Result<T> = std::result::Result<T, Error>;
