//! Parallel CPU backend tensor operations
//!
//! # CPU Backend
//!
//! This module provides the CPU kernels behind every stage. They work on flat
//! row-major `f32` slices in channel-first order with all outer axes folded
//! into one batch axis; shape validation happens before they are called.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon) over disjoint output chunks
//! - Every output element is reduced by one thread in a fixed order, so results
//!   are deterministic
//!
//! ## Implemented Ops
//!
//! - `pad`: constant / reflect / repeat padding and its scatter-add backward
//! - `conv`: grouped, strided, dilated N-d convolution with input, weight and bias gradients
//! - `norm`: batch statistics, normalization and train/eval backward
//! - `activation`: the nonlinearity table and its derivatives
//! - `matmul`: row-major products used by the affine operator
//! - `binarize`: sign binarization with a configurable zero value
//! - `add`, `sum_rows`: residual addition and bias reduction

pub mod activation;
pub mod binarize;
pub mod conv;
pub mod matmul;
pub mod norm;
pub mod pad;

use rayon::prelude::*;

/// Which gradients a backward kernel should produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Needs {
    pub input: bool,
    pub weight: bool,
    pub bias: bool,
}

impl Needs {
    #[must_use]
    pub fn any(self) -> bool {
        self.input || self.weight || self.bias
    }
}

/// Elementwise `a + b`.
#[must_use]
pub fn add(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.par_iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Sums a row-major `rows × cols` matrix over its rows.
#[must_use]
pub fn sum_rows(x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    (0..cols)
        .into_par_iter()
        .map(|j| (0..rows).map(|i| x[i * cols + j]).sum::<f32>())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_sum_rows() {
        assert_eq!(add(&[1.0, 2.0], &[0.5, -2.0]), vec![1.5, 0.0]);
        assert_eq!(sum_rows(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3, 2), vec![9.0, 12.0]);
        assert_eq!(sum_rows(&[], 0, 2), vec![0.0, 0.0]);
    }
}
