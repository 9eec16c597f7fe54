//! Core tensor data structures and operations.
//!
//! # Core Tensor Utilities
//!
//! This module defines the dense tensor every operator consumes and produces.
//!
//! It supports:
//! - Construction of N-dimensional tensors with shape and row-major data layout
//! - Axis permutation and reshaping (used to move between channel-first and
//!   channel-last layouts)
//! - Explicit gradient accumulation ("add into") for caller-owned buffers
//! - Compile-time tensor literals via the `tensor!` macro
//!
//! ## Design Highlights
//! - Values are always stored as `f32`; [`Precision`] records which grid they live on
//! - Shape is stored as a `Vec<usize>` and enforced at runtime
//! - Stage outputs are fresh tensors; inputs are never mutated by a forward step
//!
//! ## Example
//!
//! ```rust
//! use briny_kernels::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape, vec![2, 3]);
//! ```

use crate::error::{OpError, Result};
use crate::precision::Precision;

/// An N-dimensional tensor with a shape and flat row-major data.
///
/// - `shape` defines the structure, e.g. `[2, 3]` for a 2×3 matrix.
/// - `data` holds the flattened content in row-major order.
/// - `precision` tags the grid the values are rounded to.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub precision: Precision,
}

/// Element count of `shape`, or `None` if it overflows `usize`.
fn checked_numel(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

impl Tensor {
    /// Creates a new `f32` tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            shape,
            data,
            precision: Precision::F32,
        }
    }

    /// Fallible form of [`Tensor::new`].
    ///
    /// # Errors
    /// [`OpError::ShapeMismatch`] if `data` does not fill `shape` exactly.
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if checked_numel(&shape) != Some(data.len()) {
            return Err(OpError::shape(
                "tensor",
                format!("shape {shape:?} does not hold {} elements", data.len()),
            ));
        }
        Ok(Self {
            shape,
            data,
            precision: Precision::F32,
        })
    }

    /// A zero-filled tensor.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, 0.0)
    }

    /// A tensor filled with `value`.
    pub fn full(shape: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = shape.into();
        let n = shape.iter().product();
        Self {
            shape,
            data: vec![value; n],
            precision: Precision::F32,
        }
    }

    /// Re-tags the tensor and rounds its values onto the new grid.
    #[must_use]
    pub fn with_precision(mut self, precision: Precision) -> Self {
        precision.round_slice(&mut self.data);
        self.precision = precision;
        self
    }

    /// Total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// True when every element is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Returns a copy viewed under a new shape with the same element count.
    ///
    /// # Errors
    /// [`OpError::ShapeMismatch`] if the element counts differ.
    pub fn reshape(&self, shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        if checked_numel(&shape) != Some(self.numel()) {
            return Err(OpError::shapes("reshape", "target", &self.shape, &shape));
        }
        Ok(Self {
            shape,
            data: self.data.clone(),
            precision: self.precision,
        })
    }

    /// Reorders axes so that output axis `i` is input axis `axes[i]`.
    ///
    /// # Panics
    /// Panics if `axes` is not a permutation of `0..ndim`.
    #[must_use]
    pub fn permute(&self, axes: &[usize]) -> Self {
        assert_eq!(axes.len(), self.ndim(), "permutation rank mismatch");
        let strides = contiguous_strides(&self.shape);
        let out_shape: Vec<usize> = axes.iter().map(|&a| self.shape[a]).collect();
        let src_strides: Vec<usize> = axes.iter().map(|&a| strides[a]).collect();

        let mut data = Vec::with_capacity(self.numel());
        if !self.data.is_empty() {
            let mut idx = vec![0usize; out_shape.len()];
            loop {
                let off: usize = idx.iter().zip(&src_strides).map(|(i, s)| i * s).sum();
                data.push(self.data[off]);
                if !next_index(&mut idx, &out_shape) {
                    break;
                }
            }
        }

        Self {
            shape: out_shape,
            data,
            precision: self.precision,
        }
    }

    /// Moves axis `from` to position `to`, keeping the others in order.
    #[must_use]
    pub fn move_axis(&self, from: usize, to: usize) -> Self {
        if from == to {
            return self.clone();
        }
        let mut axes: Vec<usize> = (0..self.ndim()).filter(|&a| a != from).collect();
        axes.insert(to, from);
        self.permute(&axes)
    }

    /// Adds `grad` into `self` element by element.
    ///
    /// This is the only way gradients reach caller buffers; contributions are
    /// summed, never assigned. The sum is rounded to `self`'s precision.
    ///
    /// # Errors
    /// [`OpError::ShapeMismatch`] if the shapes differ.
    pub fn accumulate(&mut self, grad: &Tensor) -> Result<()> {
        if self.shape != grad.shape {
            return Err(OpError::shapes(
                "accumulate",
                "gradient",
                &self.shape,
                &grad.shape,
            ));
        }
        let p = self.precision;
        for (acc, &g) in self.data.iter_mut().zip(&grad.data) {
            *acc = p.round(*acc + g);
        }
        Ok(())
    }
}

/// Row-major strides for `shape`.
pub(crate) fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Row-major offset of a multi-index.
#[inline]
pub(crate) fn flatten(idx: &[usize], shape: &[usize]) -> usize {
    let mut stride = 1;
    let mut out = 0;

    for d in (0..idx.len()).rev() {
        out += idx[d] * stride;
        stride *= shape[d];
    }
    out
}

/// Advances a multi-index in row-major order; false once it wraps around.
#[inline]
pub(crate) fn next_index(idx: &mut [usize], limits: &[usize]) -> bool {
    for d in (0..idx.len()).rev() {
        idx[d] += 1;
        if idx[d] < limits[d] {
            return true;
        }
        idx[d] = 0;
    }
    false
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use briny_kernels::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit as f32])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
