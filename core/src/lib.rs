//! infero-rs: safe Rust binding to the Infero machine-learning inference library.
//!
//! Infero is a native library that runs pre-trained models through one of
//! several backends (TensorFlow Lite, ONNX Runtime, the TensorFlow C API,
//! TensorRT) behind a small C API. This crate loads that C API at runtime
//! and wraps it in a scoped handle with an explicit lifecycle.
//!
//! # Example
//!
//! ```ignore
//! use infero_rs::inference::{Infero, ModelSpec, ModelType, NativeRuntime};
//! use infero_rs::tensor;
//!
//! let runtime = NativeRuntime::load("libinferoapi.so")?;
//!
//! // Create a handle (fails early if the model file is missing)
//! let spec = ModelSpec::new("cyclone_model_200x200.tflite", ModelType::Tflite);
//! let mut infero = Infero::new(runtime, spec)?;
//!
//! // Run inference
//! let input = tensor::load_npy("cyclone_input_200x200.npy")?;
//! infero.initialise()?;
//! let output = infero.infer(&input, &[1, 200, 200, 1])?;
//! infero.finalise()?;
//!
//! tensor::save_npy("output.npy", &output)?;
//! ```
//!
//! # Library location
//!
//! The library is looked up as `libinferoapi.so` (`libinferoapi.dylib` on
//! macOS) through the dynamic loader unless a path is given explicitly, in
//! the configuration file, or with the `INFERO_LIB` environment variable.

pub mod cli;
pub mod config;
pub mod error;
pub mod inference;
pub mod tensor;

// Re-export commonly used types
pub use error::{InferoError, Result};
pub use inference::{Infero, ModelSpec, ModelType, NativeRuntime, Runtime};
pub use tensor::TensorLayout;
