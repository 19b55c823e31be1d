//! Error types for infero-rs.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for infero-rs operations.
pub type Result<T> = std::result::Result<T, InferoError>;

/// Errors that can occur while driving the Infero library.
#[derive(Debug, Error)]
pub enum InferoError {
    /// The native library could not be loaded.
    #[error("Failed to load Infero library {}: {message}", .path.display())]
    LibraryLoad { path: PathBuf, message: String },

    /// Model artifact does not exist.
    #[error("Model not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    /// Model type tag is not one of the supported backends.
    #[error("Unknown model type '{0}' (expected one of: tflite, onnx, tf_c, trt)")]
    UnknownModelType(String),

    /// The native backend rejected the declared output shape.
    #[error("Output shape mismatch for declared shape {declared:?}: {message}")]
    ShapeMismatch {
        declared: Vec<usize>,
        message: String,
    },

    /// A call into the native library reported a failure.
    #[error("Error in function {call}: {message} (code {code})")]
    Native {
        call: &'static str,
        code: i32,
        message: String,
    },

    /// The handle has not been initialised.
    #[error("Handle not initialised: call initialise() before inference")]
    NotInitialised,

    /// The handle has already been finalised.
    #[error("Handle already finalised")]
    Finalised,

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    Tensor(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Reading a `.npy` file failed.
    #[error("Failed to read npy array: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    /// Writing a `.npy` file failed.
    #[error("Failed to write npy array: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InferoError {
    /// Create a tensor error.
    pub fn tensor(msg: impl Into<String>) -> Self {
        Self::Tensor(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a native failure for the given C API call.
    pub fn native(call: &'static str, code: i32, msg: impl Into<String>) -> Self {
        Self::Native {
            call,
            code,
            message: msg.into(),
        }
    }

    /// Whether this error is a misuse of the handle lifecycle.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::NotInitialised | Self::Finalised)
    }
}
