//! Tensor helpers: file I/O, shape parsing, memory layout and comparison.

use ndarray::{ArrayD, ArrayViewD, CowArray, IxDyn, ShapeBuilder};
use ndarray_npy::{read_npy, write_npy, ReadNpyError};
use serde::Deserialize;
use std::os::raw::c_int;
use std::path::Path;
use tracing::debug;

use crate::error::{InferoError, Result};

/// Memory layout of a tensor buffer crossing the C boundary.
///
/// The raw codes are the `layout` arguments of the Infero C API.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// Row-major. This is what pyinfero passes.
    #[default]
    C,
    /// Column-major.
    Fortran,
}

impl TensorLayout {
    /// Raw layout code for the C API.
    pub fn code(self) -> c_int {
        match self {
            Self::C => 0,
            Self::Fortran => 1,
        }
    }
}

/// Check a shape and convert it to the C API representation.
pub fn to_c_shape(shape: &[usize]) -> Result<Vec<c_int>> {
    if shape.is_empty() {
        return Err(InferoError::tensor("shape must have rank >= 1"));
    }
    shape
        .iter()
        .map(|&dim| {
            if dim == 0 {
                return Err(InferoError::tensor(format!(
                    "zero-sized dimension in shape {:?}",
                    shape
                )));
            }
            c_int::try_from(dim).map_err(|_| {
                InferoError::tensor(format!("dimension {} does not fit a C int", dim))
            })
        })
        .collect()
}

/// View `array` as a contiguous buffer in `layout`, copying only if needed.
pub fn contiguous(array: ArrayViewD<'_, f32>, layout: TensorLayout) -> CowArray<'_, f32, IxDyn> {
    // column-major memory of `array` is row-major memory of its transpose
    let view = match layout {
        TensorLayout::C => array,
        TensorLayout::Fortran => array.reversed_axes(),
    };
    if view.is_standard_layout() {
        CowArray::from(view)
    } else {
        CowArray::from(view.as_standard_layout().into_owned())
    }
}

/// Allocate a zeroed output tensor of `shape` laid out as `layout`.
pub fn zeros(shape: &[usize], layout: TensorLayout) -> ArrayD<f32> {
    ArrayD::zeros(IxDyn(shape).set_f(layout == TensorLayout::Fortran))
}

/// Parse a shape such as `1,200,200,1` or `(1, 200, 200, 1)`.
pub fn parse_shape(s: &str) -> Result<Vec<usize>> {
    let inner = s
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    let shape = inner
        .split(|c: char| c == ',' || c == 'x')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| InferoError::tensor(format!("invalid dimension '{}' in '{}'", part, s)))
        })
        .collect::<Result<Vec<_>>>()?;
    to_c_shape(&shape)?;
    Ok(shape)
}

/// Parse `name=value` pairs used for named tensors.
pub fn split_named(s: &str) -> Result<(&str, &str)> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value.trim())),
        _ => Err(InferoError::tensor(format!(
            "expected NAME=VALUE, got '{}'",
            s
        ))),
    }
}

/// Load a `.npy` file as `f32`, casting from `f64` when needed.
pub fn load_npy(path: impl AsRef<Path>) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    match read_npy::<_, ArrayD<f32>>(path) {
        Ok(array) => Ok(array),
        Err(ReadNpyError::WrongDescriptor(_)) => {
            debug!("{} is not float32, reading as float64", path.display());
            let array: ArrayD<f64> = read_npy(path)?;
            Ok(array.mapv(|v| v as f32))
        }
        Err(e) => Err(e.into()),
    }
}

/// Save an array as `.npy`.
pub fn save_npy(path: impl AsRef<Path>, array: &ArrayD<f32>) -> Result<()> {
    write_npy(path, array)?;
    Ok(())
}

/// Load a CSV (or whitespace separated) file of numbers into `shape`.
pub fn load_csv(path: impl AsRef<Path>, shape: &[usize]) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let data = content
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.parse::<f64>().map(|v| v as f32).map_err(|_| {
                InferoError::tensor(format!("invalid value '{}' in {}", tok, path.display()))
            })
        })
        .collect::<Result<Vec<f32>>>()?;

    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(InferoError::tensor(format!(
            "{} holds {} values, shape {:?} needs {}",
            path.display(),
            data.len(),
            shape,
            expected
        )));
    }
    ArrayD::from_shape_vec(IxDyn(shape), data)
        .map_err(|e| InferoError::tensor(format!("Array shape error: {}", e)))
}

/// Load a tensor by extension: `.npy` directly, anything else as CSV of `shape`.
pub fn load_tensor(path: impl AsRef<Path>, shape: Option<&[usize]>) -> Result<ArrayD<f32>> {
    let path = path.as_ref();
    let is_npy = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("npy"))
        .unwrap_or(false);
    if is_npy {
        return load_npy(path);
    }
    let shape = shape.ok_or_else(|| {
        InferoError::tensor(format!("a shape is required to read {}", path.display()))
    })?;
    load_csv(path, shape)
}

/// Stack `copies` copies of a single sample along axis 0.
///
/// `sample` must have a leading axis of length 1.
pub fn replicate_batch(sample: &ArrayD<f32>, copies: usize) -> Result<ArrayD<f32>> {
    if sample.ndim() == 0 || sample.shape()[0] != 1 {
        return Err(InferoError::tensor(format!(
            "expected a single sample with leading dimension 1, got {:?}",
            sample.shape()
        )));
    }
    if copies == 0 {
        return Err(InferoError::tensor("batch size must be at least 1"));
    }
    let views = vec![sample.view(); copies];
    ndarray::concatenate(ndarray::Axis(0), &views)
        .map_err(|e| InferoError::tensor(format!("cannot build batch: {}", e)))
}

/// Element-wise comparison of two tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDiff {
    /// Mean squared error.
    pub mse: f32,
    /// Largest absolute difference.
    pub max_abs: f32,
    /// First element (flat index, actual, expected) beyond the tolerance.
    pub first_exceeding: Option<(usize, f32, f32)>,
}

impl TensorDiff {
    /// Whether every element is within tolerance.
    pub fn within_tolerance(&self) -> bool {
        self.first_exceeding.is_none()
    }
}

/// Compare `actual` against `expected` in logical (row-major) order.
///
/// The two tensors must have the same shape, not just the same size.
pub fn compare(actual: &ArrayD<f32>, expected: &ArrayD<f32>, tolerance: f32) -> Result<TensorDiff> {
    if actual.shape() != expected.shape() {
        return Err(InferoError::tensor(format!(
            "cannot compare shapes {:?} and {:?}",
            actual.shape(),
            expected.shape()
        )));
    }

    let mut sum_sq = 0.0f64;
    let mut max_abs = 0.0f32;
    let mut first_exceeding = None;
    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (a - e).abs();
        sum_sq += f64::from(diff) * f64::from(diff);
        max_abs = max_abs.max(diff);
        if first_exceeding.is_none() && diff > tolerance {
            first_exceeding = Some((i, a, e));
        }
    }

    let mse = if actual.is_empty() {
        0.0
    } else {
        (sum_sq / actual.len() as f64) as f32
    };
    Ok(TensorDiff {
        mse,
        max_abs,
        first_exceeding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array};

    #[test]
    fn test_parse_shape() {
        assert_eq!(parse_shape("1,200,200,1").unwrap(), vec![1, 200, 200, 1]);
        assert_eq!(parse_shape("(1, 200, 200, 1)").unwrap(), vec![1, 200, 200, 1]);
        assert_eq!(parse_shape("[1,1]").unwrap(), vec![1, 1]);
        assert_eq!(parse_shape("200x200").unwrap(), vec![200, 200]);
        assert!(parse_shape("").is_err());
        assert!(parse_shape("1,0").is_err());
        assert!(parse_shape("1,a").is_err());
    }

    #[test]
    fn test_to_c_shape_limits() {
        assert_eq!(to_c_shape(&[2, 3]).unwrap(), vec![2, 3]);
        assert!(to_c_shape(&[]).is_err());
        assert!(to_c_shape(&[usize::MAX]).is_err());
    }

    #[test]
    fn test_split_named() {
        assert_eq!(split_named("dense_6=1,1").unwrap(), ("dense_6", "1,1"));
        assert!(split_named("1,1").is_err());
        assert!(split_named("=1,1").is_err());
    }

    #[test]
    fn test_contiguous_layouts() {
        let a = arr2(&[[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn();

        let c = contiguous(a.view(), TensorLayout::C);
        assert_eq!(c.as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let f = contiguous(a.view(), TensorLayout::Fortran);
        assert_eq!(f.as_slice().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        // a transposed view is not contiguous in C order and must be copied
        let t = a.t();
        let c = contiguous(t.view(), TensorLayout::C);
        assert_eq!(c.as_slice().unwrap(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_zeros_layout() {
        let c = zeros(&[2, 3], TensorLayout::C);
        assert!(c.is_standard_layout());
        let f = zeros(&[2, 3], TensorLayout::Fortran);
        assert!(!f.is_standard_layout());
        assert!(f.as_slice_memory_order().is_some());
    }

    #[test]
    fn test_npy_roundtrip_and_f64_cast() {
        let dir = tempfile::tempdir().unwrap();

        let path32 = dir.path().join("a32.npy");
        let a = Array::from_shape_fn((2, 2), |(i, j)| (i * 2 + j) as f32).into_dyn();
        save_npy(&path32, &a).unwrap();
        assert_eq!(load_npy(&path32).unwrap(), a);

        let path64 = dir.path().join("a64.npy");
        let b = Array::from_shape_fn((3,), |i| i as f64 + 0.5).into_dyn();
        write_npy(&path64, &b).unwrap();
        let loaded = load_npy(&path64).unwrap();
        assert_eq!(loaded.shape(), &[3]);
        assert_abs_diff_eq!(loaded[[2]], 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_load_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "1.0 2.0\n3.0,4.0\n").unwrap();

        let t = load_tensor(&path, Some(&[2, 2])).unwrap();
        assert_eq!(t, arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn());

        assert!(load_csv(&path, &[3]).is_err());
        assert!(load_tensor(&path, None).is_err());
    }

    #[test]
    fn test_replicate_batch() {
        let sample = arr2(&[[1.0f32, 2.0]]).into_dyn();
        let batch = replicate_batch(&sample, 3).unwrap();
        assert_eq!(batch.shape(), &[3, 2]);
        assert_eq!(batch[[2, 1]], 2.0);

        let not_single = arr2(&[[1.0f32], [2.0]]).into_dyn();
        assert!(replicate_batch(&not_single, 2).is_err());
        assert!(replicate_batch(&sample, 0).is_err());
    }

    #[test]
    fn test_compare() {
        let a = arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn();
        let b = arr2(&[[1.0f32, 2.0], [3.0, 4.5]]).into_dyn();

        let diff = compare(&a, &a, 1e-3).unwrap();
        assert!(diff.within_tolerance());
        assert_eq!(diff.mse, 0.0);

        let diff = compare(&a, &b, 1e-3).unwrap();
        assert_eq!(diff.first_exceeding, Some((3, 4.0, 4.5)));
        assert_abs_diff_eq!(diff.max_abs, 0.5);
        assert_abs_diff_eq!(diff.mse, 0.0625);

        let c = arr2(&[[1.0f32, 2.0, 3.0]]).into_dyn();
        assert!(compare(&a, &c, 1e-3).is_err());
    }

    #[test]
    fn test_compare_rejects_transposed_shape() {
        let actual = Array::from_shape_vec(IxDyn(&[2, 3]), vec![0.0f32; 6]).unwrap();
        let expected = Array::from_shape_vec(IxDyn(&[3, 2]), vec![0.0f32; 6]).unwrap();
        assert!(matches!(
            compare(&actual, &expected, 1e-3),
            Err(InferoError::Tensor(_))
        ));
    }
}
