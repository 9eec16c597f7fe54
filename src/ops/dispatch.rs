//! Operation Dispatch Layer
//!
//! This module selects the instruction path for each kernel call from the
//! precision of the operator's inputs.
//!
//! Each function runs the `cpu` kernel and then finishes its result:
//! 1. `Float` returns the `f32` result untouched
//! 2. `Reduced(p)` rounds every produced value onto `p`'s grid
//!
//! # Design Highlights
//! - **Single numeric core**: both paths share one set of kernels
//! - **Minimal overhead**: the float path never touches the result
//! - **Deterministic**: rounding is elementwise and applied after reduction
//!
//! # Example
//! ```rust
//! use briny_kernels::ops::dispatch::{self, Path};
//! use briny_kernels::params::Activation;
//! use briny_kernels::precision::Precision;
//!
//! let path = Path::of(Precision::F16);
//! let y = dispatch::activation(path, Activation::Sigmoid, &[0.1]);
//! assert_eq!(y[0], Precision::F16.round(y[0]));
//! ```

use super::cpu::{
    self, Needs, activation as act, binarize as bin, conv, matmul as mm, norm, pad as pd,
};
use crate::params::{Activation, PadMode};
use crate::precision::Precision;

/// Instruction path of one operator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Path {
    /// Plain `f32`.
    #[default]
    Float,
    /// `f32` compute, results rounded to a reduced storage grid.
    Reduced(Precision),
}

impl Path {
    /// Path for inputs stored at `precision`.
    #[must_use]
    pub fn of(precision: Precision) -> Self {
        if precision.is_reduced() {
            Self::Reduced(precision)
        } else {
            Self::Float
        }
    }

    /// Storage precision of results on this path.
    #[must_use]
    pub fn precision(self) -> Precision {
        match self {
            Self::Float => Precision::F32,
            Self::Reduced(p) => p,
        }
    }

    fn finish(self, mut data: Vec<f32>) -> Vec<f32> {
        if let Self::Reduced(p) = self {
            p.round_slice(&mut data);
        }
        data
    }

    fn finish_opt(self, data: Option<Vec<f32>>) -> Option<Vec<f32>> {
        data.map(|d| self.finish(d))
    }
}

/// Dispatches padding of the trailing `widths.len()` axes.
#[must_use]
pub fn pad(
    path: Path,
    x: &[f32],
    shape: &[usize],
    widths: &[(usize, usize)],
    mode: PadMode,
) -> Vec<f32> {
    path.finish(pd::pad(x, shape, widths, mode))
}

/// Dispatches the scatter-add backward of [`pad`].
#[must_use]
pub fn pad_backward(
    path: Path,
    dy: &[f32],
    shape: &[usize],
    widths: &[(usize, usize)],
    mode: PadMode,
) -> Vec<f32> {
    path.finish(pd::pad_backward(dy, shape, widths, mode))
}

/// Dispatches a grouped convolution.
#[must_use]
pub fn conv(
    path: Path,
    x: &[f32],
    w: &[f32],
    bias: Option<&[f32]>,
    g: &conv::ConvGeometry,
) -> Vec<f32> {
    path.finish(conv::conv(x, w, bias, g))
}

/// Dispatches the convolution backward.
///
/// # Returns
/// - `dx`, `dw`, `db`, each present only if `needs` asked for it
#[must_use]
pub fn conv_backward(
    path: Path,
    x: &[f32],
    w: &[f32],
    dy: &[f32],
    g: &conv::ConvGeometry,
    needs: Needs,
) -> conv::ConvGrads {
    let grads = conv::conv_backward(x, w, dy, g, needs);
    conv::ConvGrads {
        dx: path.finish_opt(grads.dx),
        dw: path.finish_opt(grads.dw),
        db: path.finish_opt(grads.db),
    }
}

/// Dispatches the normalization `gamma * (x - mean) / sqrt(var + eps) + beta`.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn normalize(
    path: Path,
    x: &[f32],
    g: norm::NormGeometry,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
    beta: &[f32],
    eps: f32,
) -> Vec<f32> {
    path.finish(norm::normalize(x, g, mean, var, gamma, beta, eps))
}

/// Dispatches the normalization backward.
///
/// # Behavior
/// `batch` selects differentiation through the batch statistics; otherwise
/// `mean`/`var` are treated as inputs of the affine map.
#[allow(clippy::too_many_arguments)]
#[must_use]
pub fn norm_backward(
    path: Path,
    batch: bool,
    x: &[f32],
    dy: &[f32],
    g: norm::NormGeometry,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
    eps: f32,
    needs: norm::NormNeeds,
) -> norm::NormGrads {
    let grads = if batch {
        norm::backward_batch(x, dy, g, mean, var, gamma, eps, needs)
    } else {
        norm::backward_running(x, dy, g, mean, var, gamma, eps, needs)
    };
    norm::NormGrads {
        dx: path.finish_opt(grads.dx),
        dbeta: path.finish_opt(grads.dbeta),
        dgamma: path.finish_opt(grads.dgamma),
        dmean: path.finish_opt(grads.dmean),
        dvar: path.finish_opt(grads.dvar),
    }
}

/// Dispatches elementwise addition.
#[must_use]
pub fn add(path: Path, a: &[f32], b: &[f32]) -> Vec<f32> {
    path.finish(cpu::add(a, b))
}

/// Dispatches an activation forward pass.
#[must_use]
pub fn activation(path: Path, f: Activation, x: &[f32]) -> Vec<f32> {
    path.finish(act::forward(f, x))
}

/// Dispatches an activation backward pass.
///
/// `y` must be the output [`activation`] produced for `x` on the same path.
#[must_use]
pub fn activation_backward(
    path: Path,
    f: Activation,
    x: &[f32],
    y: &[f32],
    dy: &[f32],
) -> Vec<f32> {
    path.finish(act::backward(f, x, y, dy))
}

/// Dispatches weight binarization into a caller buffer.
pub fn binarize_into(path: Path, w: &[f32], zero_value: f32, out: &mut [f32]) {
    bin::binarize_into(w, zero_value, out);
    if let Path::Reduced(p) = path {
        p.round_slice(out);
    }
}

/// Dispatches weight binarization.
#[must_use]
pub fn binarize(path: Path, w: &[f32], zero_value: f32) -> Vec<f32> {
    path.finish(bin::binarize(w, zero_value))
}

/// Dispatches `X × W + b` (`m×k` by `k×n`, bias broadcast over rows).
///
/// # Behavior
/// The bias is added before rounding, so the reduced path rounds once.
#[must_use]
pub fn affine(
    path: Path,
    x: &[f32],
    w: &[f32],
    bias: Option<&[f32]>,
    m: usize,
    k: usize,
    n: usize,
) -> Vec<f32> {
    let mut y = mm::matmul(x, w, m, k, n);
    if let Some(bias) = bias {
        mm::add_bias_rows(&mut y, bias);
    }
    path.finish(y)
}

/// Dispatches `A × Bᵀ` (`m×k` by `n×k`).
#[must_use]
pub fn matmul_nt(path: Path, a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    path.finish(mm::matmul_nt(a, b, m, k, n))
}

/// Dispatches `Aᵀ × B` (`k×m` by `k×n`).
#[must_use]
pub fn matmul_tn(path: Path, a: &[f32], b: &[f32], k: usize, m: usize, n: usize) -> Vec<f32> {
    path.finish(mm::matmul_tn(a, b, k, m, n))
}

/// Dispatches a column sum over `rows × cols` (bias gradients).
#[must_use]
pub fn sum_rows(path: Path, x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    path.finish(cpu::sum_rows(x, rows, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_follows_precision() {
        assert_eq!(Path::of(Precision::F32), Path::Float);
        assert_eq!(Path::of(Precision::BF16), Path::Reduced(Precision::BF16));
        assert_eq!(Path::of(Precision::F16).precision(), Precision::F16);
    }

    #[test]
    fn reduced_path_rounds_results() {
        let a = [1.0, 1.0 / 4096.0];
        let b = [1.0, 1.0];
        assert_eq!(affine(Path::Float, &a, &b, None, 1, 2, 1), vec![1.0 + 1.0 / 4096.0]);
        assert_eq!(affine(Path::Reduced(Precision::F16), &a, &b, None, 1, 2, 1), vec![1.0]);
        assert_eq!(affine(Path::Float, &a, &b, Some(&[1.0]), 1, 2, 1), vec![2.0 + 1.0 / 4096.0]);
    }

    #[test]
    fn binarize_into_overwrites() {
        let mut out = [9.0; 3];
        binarize_into(Path::Float, &[-0.5, 0.0, 2.0], -1.0, &mut out);
        assert_eq!(out, [-1.0, -1.0, 1.0]);
    }
}
