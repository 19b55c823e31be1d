//! FFI declarations for the Infero C API (`libinferoapi`).
//!
//! This module contains the raw symbol table, resolved at runtime with
//! `dlopen`. Use the safe wrappers in the `runtime` and `model` modules
//! instead of calling these directly.
#![allow(non_camel_case_types)]

use dlopen::wrapper::WrapperApi;
use dlopen_derive::WrapperApi;
use std::os::raw::{c_char, c_int};

/// Opaque native model handle.
#[repr(C)]
pub struct infero_handle_t {
    _private: [u8; 0],
}

pub const INFERO_SUCCESS: c_int = 0;
pub const INFERO_ERROR_GENERAL_EXCEPTION: c_int = 1;
pub const INFERO_ERROR_UNKNOWN_EXCEPTION: c_int = 2;

#[derive(WrapperApi)]
pub struct InferoApi {
    // Library lifecycle
    infero_initialise: unsafe extern "C" fn(argc: c_int, argv: *mut *mut c_char) -> c_int,
    infero_finalise: unsafe extern "C" fn() -> c_int,
    infero_error_string: unsafe extern "C" fn(err: c_int) -> *const c_char,

    // Handle lifecycle
    infero_create_handle_from_yaml_str:
        unsafe extern "C" fn(config: *const c_char, h: *mut *mut infero_handle_t) -> c_int,
    infero_create_handle_from_yaml_file:
        unsafe extern "C" fn(path: *const c_char, h: *mut *mut infero_handle_t) -> c_int,
    infero_open_handle: unsafe extern "C" fn(h: *mut infero_handle_t) -> c_int,
    infero_close_handle: unsafe extern "C" fn(h: *mut infero_handle_t) -> c_int,
    infero_delete_handle: unsafe extern "C" fn(h: *mut infero_handle_t) -> c_int,

    // Inference
    infero_inference_float: unsafe extern "C" fn(
        h: *mut infero_handle_t,
        rank1: c_int,
        data1: *const f32,
        shape1: *const c_int,
        layout1: c_int,
        rank2: c_int,
        data2: *mut f32,
        shape2: *const c_int,
        layout2: c_int,
    ) -> c_int,
    infero_inference_float_mimo: unsafe extern "C" fn(
        h: *mut infero_handle_t,
        n_inputs: c_int,
        i_names: *const *const c_char,
        i_ranks: *const c_int,
        i_shape: *const *const c_int,
        i_data: *const *const f32,
        i_layout: c_int,
        n_outputs: c_int,
        o_names: *const *const c_char,
        o_ranks: *const c_int,
        o_shape: *const *const c_int,
        o_data: *const *mut f32,
        o_layout: c_int,
    ) -> c_int,

    // Diagnostics
    infero_print_statistics: unsafe extern "C" fn(h: *mut infero_handle_t) -> c_int,
    infero_print_config: unsafe extern "C" fn(h: *mut infero_handle_t) -> c_int,
}
