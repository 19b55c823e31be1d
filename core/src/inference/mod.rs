//! Model inference module.
//!
//! This module provides the runtime-loaded bindings to the Infero C API
//! and safe Rust wrappers for building model handles and running inference.

mod ffi;
mod model;
mod runtime;

pub(crate) use model::yaml_scalar;
pub use model::{
    clike_param_name, HandleState, InferenceStats, Infero, ModelSpec, ModelType,
};
pub use runtime::{
    classify_inference_failure, NativeHandle, NativeRuntime, Runtime, TensorIn, TensorOut,
};
