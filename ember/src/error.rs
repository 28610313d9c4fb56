//! Error types for Ember

use thiserror::Error;

use crate::capabilities::Features;

/// Result type alias using Ember's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Ember operations
#[derive(Error, Debug)]
pub enum Error {
    /// No adapter could be found, or device creation failed even with the
    /// minimal request.
    #[error("GPU device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Capabilities were queried before a device was negotiated, or after
    /// the device was lost and before it was negotiated again.
    #[error("GPU device not initialized")]
    DeviceNotInitialized,

    #[error("allocation of {requested} bytes exceeds {limit_name} ({limit} bytes)")]
    AllocationLimitExceeded {
        requested: u64,
        limit: u64,
        limit_name: &'static str,
    },

    #[error("kernel {kernel} requires unsupported features: {missing:?}")]
    UnsupportedFeature { kernel: String, missing: Features },

    #[error("pipeline compile error in {kernel}: {message}")]
    PipelineCompile { kernel: String, message: String },

    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
