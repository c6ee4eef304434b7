//! Error types for dataset construction, loading and dispatch

use std::io;
use thiserror::Error;

/// Result type for dataset operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dataset operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during file operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Memory allocation failed
    #[error("Memory allocation failed")]
    MemoryAllocationFailed,

    /// Device memory budget exceeded
    #[error("Memory budget exceeded: requested {requested} bytes, available {available} bytes")]
    MemoryBudgetExceeded {
        /// Requested memory in bytes
        requested: usize,
        /// Available memory in bytes
        available: usize,
    },

    /// Attribute combination not supported by the factory
    #[error("Unsupported attributes: {0}")]
    UnsupportedAttributes(String),

    /// Element type not supported by the factory
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// Error or delta function undefined for the dataset's storage layout
    #[error("{function} is not defined for {layout} datasets")]
    UnsupportedLayout {
        /// Error function name
        function: String,
        /// Layout description
        layout: String,
    },

    /// Error function undefined for the output activation
    #[error("{function} output delta requires a sigmoid or softmax activation, got {activation}")]
    UnsupportedActivation {
        /// Error function name
        function: String,
        /// Activation name
        activation: String,
    },

    /// Position, offset or index outside the valid range
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// Negative value passed to a signed loader
    #[error("Negative {field} at position {position}: {value}")]
    NegativeValue {
        /// Which input carried the value
        field: &'static str,
        /// Position of the value in its input
        position: usize,
        /// The offending value
        value: i64,
    },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid operation for the dataset's attributes or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Data type mismatch
    #[error("Data type mismatch: {0}")]
    TypeMismatch(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON configuration error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error belongs to the configuration class
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedAttributes(_)
                | Error::UnsupportedDataType(_)
                | Error::UnsupportedLayout { .. }
                | Error::UnsupportedActivation { .. }
                | Error::InvalidOperation(_)
        )
    }

    /// Whether this error belongs to the bounds class
    pub fn is_bounds(&self) -> bool {
        matches!(self, Error::OutOfBounds(_) | Error::NegativeValue { .. })
    }

    /// Whether this error belongs to the resource class
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            Error::MemoryAllocationFailed | Error::MemoryBudgetExceeded { .. } | Error::Io(_)
        )
    }
}
