//! A stand-in `libinferoapi` for exercising the native runtime without an
//! inference backend.
//!
//! It keeps the process state of the real C API: a static initialised flag,
//! one error string shared by every call, and the `argv` handed to
//! `infero_initialise`, which must stay valid until `infero_finalise`.
//!
//! No model is loaded. A handle is driven by keys of its configuration string:
//!
//! - `outputShape`: shape the model produces, e.g. `1,200,200,1`. Defaults to
//!   the input shape.
//! - `expectLayout`: layout code every inference call must carry.
//! - `outputNames`: comma separated output names known to MIMO inference.
//! - `mimoError`: message MIMO inference fails with.
//! - `failOpen`: `general` or `unknown`, the exception `infero_open_handle` raises.
//! - `failClose`: `infero_close_handle` fails when set.
//!
//! Single-output inference writes twice the input. MIMO output `k` is filled
//! with the sum of every input element plus `k`.
#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use parking_lot::{const_mutex, Mutex};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

const INFERO_SUCCESS: c_int = 0;
const INFERO_ERROR_GENERAL_EXCEPTION: c_int = 1;
const INFERO_ERROR_UNKNOWN_EXCEPTION: c_int = 2;

const OUTPUT_SHAPE_ASSERTION: &str =
    "Assertion failed: tOut.shape() == out_shape in infer, line 123 of InferenceModelTFlite.cc";

static INITIALISED: AtomicBool = AtomicBool::new(false);
static LIVE_HANDLES: AtomicI32 = AtomicI32::new(0);
static ERROR: Mutex<Option<CString>> = const_mutex(None);
// address of argv and the program name it held when initialised
static ARGV: Mutex<Option<(usize, String)>> = const_mutex(None);

type Outcome = Result<(), String>;

/// Run an API body, turning errors and panics into return codes.
fn wrap(body: impl FnOnce() -> Outcome) -> c_int {
    let (code, message) = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => return INFERO_SUCCESS,
        Ok(Err(message)) => (INFERO_ERROR_GENERAL_EXCEPTION, message),
        Err(_) => (
            INFERO_ERROR_UNKNOWN_EXCEPTION,
            "Unrecognised and unknown exception".to_string(),
        ),
    };
    *ERROR.lock() = CString::new(message).ok();
    code
}

fn require_initialised() -> Outcome {
    if INITIALISED.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err("Infero library not initialised!".to_string())
    }
}

unsafe fn program_name(argv: *mut *mut c_char) -> String {
    CStr::from_ptr(*argv).to_string_lossy().into_owned()
}

/// Fails if the `argv` given to `infero_initialise` no longer holds the program name.
unsafe fn check_argv() -> Outcome {
    match ARGV.lock().as_ref() {
        Some((argv, name)) if program_name(*argv as *mut *mut c_char) == *name => Ok(()),
        Some(_) => Err("argv was released while the library is initialised".to_string()),
        None => Err("Infero library not initialised!".to_string()),
    }
}

unsafe fn c_slice<'a, T>(data: *const T, len: c_int, what: &str) -> Result<&'a [T], String> {
    if data.is_null() || len < 1 {
        return Err(format!("invalid {} ({} entries)", what, len));
    }
    Ok(slice::from_raw_parts(data, len as usize))
}

unsafe fn c_str<'a>(s: *const c_char) -> Result<&'a str, String> {
    if s.is_null() {
        return Err("null string".to_string());
    }
    CStr::from_ptr(s).to_str().map_err(|e| e.to_string())
}

fn element_count(shape: &[c_int]) -> Result<usize, String> {
    shape.iter().try_fold(1usize, |n, &dim| {
        if dim < 1 {
            Err(format!("invalid dimension {} in shape {:?}", dim, shape))
        } else {
            Ok(n * dim as usize)
        }
    })
}

/// Native model handle.
pub struct infero_handle_t {
    params: Vec<(String, String)>,
    open: bool,
}

impl infero_handle_t {
    fn parse(config: &str) -> Result<Self, String> {
        let params = config
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.split_once(':')
                    .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
                    .ok_or_else(|| format!("invalid configuration line '{}'", line))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let handle = Self {
            params,
            open: false,
        };
        for key in ["path", "type"] {
            if handle.param(key).is_none() {
                return Err(format!("configuration has no '{}' entry", key));
            }
        }
        Ok(handle)
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn output_shape(&self) -> Result<Option<Vec<c_int>>, String> {
        self.param("outputShape")
            .map(|shape| {
                shape
                    .split(',')
                    .map(|dim| {
                        dim.trim()
                            .parse()
                            .map_err(|_| format!("invalid outputShape '{}'", shape))
                    })
                    .collect()
            })
            .transpose()
    }

    fn check_layouts(&self, input: c_int, output: c_int) -> Outcome {
        if input != output || !(0..=1).contains(&input) {
            return Err(format!("unsupported layouts {} and {}", input, output));
        }
        match self.param("expectLayout") {
            Some(expected) if expected != input.to_string() => {
                Err(format!("expected layout {}, got {}", expected, input))
            }
            _ => Ok(()),
        }
    }
}

unsafe fn handle_mut<'a>(h: *mut infero_handle_t) -> Result<&'a mut infero_handle_t, String> {
    h.as_mut().ok_or_else(|| "null model handle".to_string())
}

unsafe fn open_handle_mut<'a>(h: *mut infero_handle_t) -> Result<&'a mut infero_handle_t, String> {
    let handle = handle_mut(h)?;
    if !handle.open {
        return Err("model handle is not open".to_string());
    }
    Ok(handle)
}

unsafe fn create(config: &str, h: *mut *mut infero_handle_t) -> Outcome {
    require_initialised()?;
    check_argv()?;
    if h.is_null() {
        return Err("null handle pointer".to_string());
    }
    let handle = infero_handle_t::parse(config)?;
    *h = Box::into_raw(Box::new(handle));
    LIVE_HANDLES.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[no_mangle]
pub unsafe extern "C" fn infero_initialise(argc: c_int, argv: *mut *mut c_char) -> c_int {
    wrap(|| {
        if argc < 1 || argv.is_null() || (*argv).is_null() {
            return Err("infero_initialise needs a program name".to_string());
        }
        if !(*argv.add(argc as usize)).is_null() {
            return Err("argv is not null terminated".to_string());
        }
        if INITIALISED.swap(true, Ordering::SeqCst) {
            return Err("Initialising Infero library twice!".to_string());
        }
        *ARGV.lock() = Some((argv as usize, program_name(argv)));
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_finalise() -> c_int {
    wrap(|| {
        let argv_ok = check_argv();
        if !INITIALISED.swap(false, Ordering::SeqCst) {
            return Err("Infero library not initialised!".to_string());
        }
        *ARGV.lock() = None;
        argv_ok
    })
}

#[no_mangle]
pub extern "C" fn infero_error_string(err: c_int) -> *const c_char {
    match err {
        INFERO_SUCCESS => b"Success\0".as_ptr().cast(),
        INFERO_ERROR_GENERAL_EXCEPTION | INFERO_ERROR_UNKNOWN_EXCEPTION => ERROR
            .lock()
            .as_ref()
            .map_or(ptr::null(), |message| message.as_ptr()),
        _ => b"<unknown>\0".as_ptr().cast(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn infero_create_handle_from_yaml_str(
    config: *const c_char,
    h: *mut *mut infero_handle_t,
) -> c_int {
    wrap(|| create(c_str(config)?, h))
}

#[no_mangle]
pub unsafe extern "C" fn infero_create_handle_from_yaml_file(
    path: *const c_char,
    h: *mut *mut infero_handle_t,
) -> c_int {
    wrap(|| {
        let path = c_str(path)?;
        let config =
            std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path, e))?;
        create(&config, h)
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_open_handle(h: *mut infero_handle_t) -> c_int {
    wrap(|| {
        let handle = handle_mut(h)?;
        match handle.param("failOpen") {
            Some("unknown") => panic!("backend crashed while opening the model"),
            Some(_) => Err("Cannot open model: interpreter construction failed".to_string()),
            None => {
                handle.open = true;
                Ok(())
            }
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_close_handle(h: *mut infero_handle_t) -> c_int {
    wrap(|| {
        let handle = open_handle_mut(h)?;
        if handle.param("failClose").is_some() {
            return Err("Cannot close model: backend session busy".to_string());
        }
        handle.open = false;
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_delete_handle(h: *mut infero_handle_t) -> c_int {
    wrap(|| {
        if h.is_null() {
            return Err("null model handle".to_string());
        }
        drop(Box::from_raw(h));
        LIVE_HANDLES.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_inference_float(
    h: *mut infero_handle_t,
    rank1: c_int,
    data1: *const f32,
    shape1: *const c_int,
    layout1: c_int,
    rank2: c_int,
    data2: *mut f32,
    shape2: *const c_int,
    layout2: c_int,
) -> c_int {
    wrap(|| {
        let handle = open_handle_mut(h)?;
        handle.check_layouts(layout1, layout2)?;
        let in_shape = c_slice(shape1, rank1, "input shape")?;
        let out_shape = c_slice(shape2, rank2, "output shape")?;

        let produced = handle.output_shape()?.unwrap_or_else(|| in_shape.to_vec());
        if out_shape != produced.as_slice() {
            return Err(OUTPUT_SHAPE_ASSERTION.to_string());
        }

        let input = slice::from_raw_parts(data1, element_count(in_shape)?);
        let output = slice::from_raw_parts_mut(data2, element_count(out_shape)?);
        for (o, i) in output.iter_mut().zip(input.iter().cycle()) {
            *o = i * 2.0;
        }
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_inference_float_mimo(
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
) -> c_int {
    wrap(|| {
        let handle = open_handle_mut(h)?;
        handle.check_layouts(i_layout, o_layout)?;
        if let Some(message) = handle.param("mimoError") {
            return Err(message.to_string());
        }

        let i_names = c_slice(i_names, n_inputs, "input names")?;
        let i_ranks = c_slice(i_ranks, n_inputs, "input ranks")?;
        let i_shape = c_slice(i_shape, n_inputs, "input shapes")?;
        let i_data = c_slice(i_data, n_inputs, "input data")?;
        let mut total = 0.0f32;
        for k in 0..i_names.len() {
            c_str(i_names[k])?;
            let shape = c_slice(i_shape[k], i_ranks[k], "input shape")?;
            total += slice::from_raw_parts(i_data[k], element_count(shape)?)
                .iter()
                .sum::<f32>();
        }

        let known: Option<Vec<&str>> = handle
            .param("outputNames")
            .map(|names| names.split(',').map(str::trim).collect());
        let o_names = c_slice(o_names, n_outputs, "output names")?;
        let o_ranks = c_slice(o_ranks, n_outputs, "output ranks")?;
        let o_shape = c_slice(o_shape, n_outputs, "output shapes")?;
        let o_data = c_slice(o_data, n_outputs, "output data")?;
        for k in 0..o_names.len() {
            let name = c_str(o_names[k])?;
            if let Some(known) = &known {
                if !known.contains(&name) {
                    return Err(format!("unknown output tensor '{}'", name));
                }
            }
            let shape = c_slice(o_shape[k], o_ranks[k], "output shape")?;
            slice::from_raw_parts_mut(o_data[k], element_count(shape)?).fill(total + k as f32);
        }
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_print_config(h: *mut infero_handle_t) -> c_int {
    wrap(|| {
        let handle = handle_mut(h)?;
        for (key, value) in &handle.params {
            println!("{}: {}", key, value);
        }
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn infero_print_statistics(h: *mut infero_handle_t) -> c_int {
    wrap(|| {
        handle_mut(h)?;
        println!("stub backend: no statistics");
        Ok(())
    })
}

/// Test hook: 1 while the library is initialised.
#[no_mangle]
pub extern "C" fn infero_stub_initialised() -> c_int {
    c_int::from(INITIALISED.load(Ordering::SeqCst))
}

/// Test hook: number of handles created and not yet deleted.
#[no_mangle]
pub extern "C" fn infero_stub_live_handles() -> c_int {
    LIVE_HANDLES.load(Ordering::SeqCst)
}
