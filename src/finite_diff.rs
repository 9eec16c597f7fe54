//! Finite difference utilities for gradient verification.
//!
//! Operators evaluate in `f32`, so the objective takes `f32` points and the
//! differences are formed in `f64`.

/// Gradients by central finite differences.
///
/// # Arguments
/// * `f` - Scalar objective of the variable values
/// * `point` - Where to differentiate
/// * `eps` - Step size; for `f32` operators `1e-3` is typical
///
/// # Example
/// ```
/// use briny_kernels::finite_diff::finite_diff_grad;
///
/// let f = |v: &[f32]| f64::from(v[0] * v[0] + 3.0 * v[1]);
/// let g = finite_diff_grad(f, &[2.0, -1.0], 1e-2);
/// assert!((g[0] - 4.0).abs() < 1e-3);
/// assert!((g[1] - 3.0).abs() < 1e-3);
/// ```
pub fn finite_diff_grad<F>(f: F, point: &[f32], eps: f32) -> Vec<f64>
where
    F: Fn(&[f32]) -> f64,
{
    let mut perturbed = point.to_vec();
    (0..point.len())
        .map(|i| {
            perturbed[i] = point[i] + eps;
            let plus = f(&perturbed);
            perturbed[i] = point[i] - eps;
            let minus = f(&perturbed);
            // the actual step after f32 rounding
            let h = f64::from(point[i] + eps) - f64::from(point[i] - eps);
            perturbed[i] = point[i];
            (plus - minus) / h
        })
        .collect()
}

/// Largest absolute difference between two gradient vectors.
///
/// # Panics
/// If the lengths differ.
#[must_use]
pub fn max_grad_error(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
}

/// Weighted sum `Σ r_i y_i`, the objective whose gradient w.r.t. `y` is `r`.
#[must_use]
pub fn weighted_sum(y: &[f32], r: &[f32]) -> f64 {
    y.iter().zip(r).map(|(a, b)| f64::from(*a) * f64::from(*b)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn central_difference_of_a_cubic() {
        let f = |v: &[f32]| f64::from(v[0]).powi(3);
        let g = finite_diff_grad(f, &[1.5], 1e-3);
        assert!((g[0] - 6.75).abs() < 1e-3);
    }

    #[test]
    fn max_error() {
        let err = max_grad_error(&[1.0, 2.0, 3.0], &[1.1, 2.0, 2.8]);
        assert!((err - 0.2).abs() < 1e-10);
        assert_eq!(weighted_sum(&[1.0, 2.0], &[3.0, -1.0]), 1.0);
    }
}
