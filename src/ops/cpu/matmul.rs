//! Row-major matrix products used by the affine operator.
//!
//! All three kernels parallelize over output rows with `rayon`, one row per
//! chunk, and reduce each element in a fixed order.

use rayon::prelude::*;

/// `C = A × B` with `A: m×k`, `B: k×n`.
#[must_use]
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    if n == 0 {
        return out;
    }
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, c) in row.iter_mut().enumerate() {
            let mut sum = 0.0;
            for (l, &av) in a_row.iter().enumerate() {
                sum += av * b[l * n + j];
            }
            *c = sum;
        }
    });
    debug_assert_eq!(out.len(), m * n);
    out
}

/// `C = A × Bᵀ` with `A: m×k`, `B: n×k`.
#[must_use]
pub fn matmul_nt(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    if n == 0 {
        return out;
    }
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, c) in row.iter_mut().enumerate() {
            let b_row = &b[j * k..(j + 1) * k];
            *c = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
        }
    });
    out
}

/// `C = Aᵀ × B` with `A: k×m`, `B: k×n`.
#[must_use]
pub fn matmul_tn(a: &[f32], b: &[f32], k: usize, m: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    if n == 0 {
        return out;
    }
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for l in 0..k {
            let av = a[l * m + i];
            let b_row = &b[l * n..(l + 1) * n];
            for (c, &bv) in row.iter_mut().zip(b_row) {
                *c += av * bv;
            }
        }
    });
    out
}

/// Adds `bias` to every row of a row-major matrix with `bias.len()` columns.
pub fn add_bias_rows(y: &mut [f32], bias: &[f32]) {
    if bias.is_empty() {
        return;
    }
    y.par_chunks_mut(bias.len()).for_each(|row| {
        for (v, b) in row.iter_mut().zip(bias) {
            *v += b;
        }
    });
}
