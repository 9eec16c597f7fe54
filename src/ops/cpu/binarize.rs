//! Sign binarization.

use rayon::prelude::*;

/// `+1` for positive, `-1` for negative, `zero_value` for exact zeros.
///
/// NaN has no sign and is passed through.
#[inline]
#[must_use]
pub fn sign(v: f32, zero_value: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else if v == 0.0 {
        zero_value
    } else {
        v
    }
}

/// Writes the binarized `w` into `out`.
pub fn binarize_into(w: &[f32], zero_value: f32, out: &mut [f32]) {
    out.par_iter_mut()
        .zip(w.par_iter())
        .for_each(|(o, &v)| *o = sign(v, zero_value));
}

/// Returns the binarized `w`.
#[must_use]
pub fn binarize(w: &[f32], zero_value: f32) -> Vec<f32> {
    let mut out = vec![0.0f32; w.len()];
    binarize_into(w, zero_value, &mut out);
    out
}
