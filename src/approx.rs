//! Utilities to approximate equality of tensors.

use crate::precision::Precision;
use crate::tensors::Tensor;

/// The max error accepted on paths that use a binarized weight.
pub const BINARY_GRAD_ATOL: f32 = 1e-2;

/// The max error accepted between two `f32` compositions of the same math.
pub const FLOAT_ATOL: f32 = 1e-6;

/// The max error accepted on a reduced-precision path.
pub const REDUCED_ATOL: f32 = 5e-2;

/// Default tolerance for results stored at `precision`.
#[must_use]
pub fn tolerance(precision: Precision) -> f32 {
    if precision.is_reduced() {
        REDUCED_ATOL
    } else {
        FLOAT_ATOL
    }
}

/// Largest elementwise `|a - b|`.
///
/// Returns infinity when the lengths differ and NaN if any pair contains a NaN.
#[must_use]
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter().zip(b).fold(0.0, |m, (x, y)| {
        let d = (x - y).abs();
        if d.is_nan() || m.is_nan() { f32::NAN } else { m.max(d) }
    })
}

/// Checks `|a - b| <= atol` elementwise with matching shapes.
///
/// A NaN on either side is never close.
#[must_use]
pub fn all_close(a: &Tensor, b: &Tensor, atol: f32) -> bool {
    a.shape == b.shape && max_abs_diff(&a.data, &b.data) <= atol
}
