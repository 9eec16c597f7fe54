//! briny_kernels: forward and backward kernels for two differentiable operators.
//!
//! Built as reference implementations for graph runtimes that need exact
//! shape arithmetic and explicit gradient plumbing rather than autograd magic.
//!
//! # Features
//!
//! - Binary-connect affine: `x · sign(w) + b` with a straight-through input gradient.
//! - Fused convolution: padding, grouped/dilated convolution, batch
//!   normalization, residual addition and an activation in one forward and
//!   one backward pass.
//! - Every stage also available as an unfused operator.
//! - `f16`/`bf16` instruction paths that round each stage result.
//!
//! # Goals
//!
//! - Prioritize correctness and explicitness over raw speed.
//! - Surface every error before a caller buffer is touched.
//! - Keep gradient requests explicit: absent, skipped, or accumulated.
//!
//! # Modules
//!
//! - [`tensors`] — Dense `f32` tensors with a precision tag.
//! - [`affine`] — The binary-connect affine operator.
//! - [`fused`] — The fused convolution operator.
//! - [`backprop`] — Unfused per-stage operators.
//! - [`stages`] — The stage kernels both operators are built from.
//! - [`params`] — Operator configuration and tag parsing.
//! - [`ops`] — CPU kernels and instruction-path dispatch.
//! - [`approx`], [`finite_diff`] — Tolerances and numerical gradients for verification.
//!
//! # Example
//!
//! ```rust
//! use briny_kernels::{AffineGrads, Tensor, binary_connect_affine, binary_connect_affine_backward};
//!
//! let x = Tensor::full(vec![2, 4], 1.0);
//! let w = Tensor::new(vec![4, 2], vec![0.5, -0.5, 0.0, 1.0, -2.0, 2.0, 0.1, 0.0]);
//! let mut wb = Tensor::zeros(vec![4, 2]);
//! let y = binary_connect_affine(&x, &w, &mut wb, None, 1, 1.0).unwrap();
//! assert_eq!(y.data, vec![2.0, 2.0, 2.0, 2.0]);
//!
//! let mut dw = Tensor::zeros(vec![4, 2]);
//! let mut grads = AffineGrads::new();
//! grads.weight = (&mut dw).into();
//! let dy = Tensor::full(vec![2, 2], 1.0);
//! binary_connect_affine_backward(&x, &w, None, &dy, 1, 1.0, &mut grads).unwrap();
//! assert_eq!(dw.data, vec![2.0; 8]);
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::too_many_arguments,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::many_single_char_names,
    clippy::similar_names
)]
#![deny(unsafe_code)]

pub mod affine;
pub mod approx;
pub mod backprop;
pub mod error;
pub mod finite_diff;
pub mod fused;
pub mod grad;
pub mod ops;
pub mod params;
pub mod precision;
pub mod stages;
pub mod tensors;

pub use affine::{
    AffineGrads, BinaryConnectAffine, binary_connect_affine, binary_connect_affine_backward,
};
pub use error::{OpError, Result};
pub use fused::{
    FusedConvolution, FusedGrads, FusedInputs, NormTensors, fused_convolution,
    fused_convolution_backward,
};
pub use grad::GradRequest;
pub use params::{Activation, BatchStat, ConvParams, FusedConvConfig, Layout, NormParams, PadMode};
pub use precision::Precision;
pub use tensors::Tensor;
