//! # Operation Dispatch Layer
//!
//! This module holds the numeric kernels behind every stage and the layer that
//! routes a call onto an instruction path.
//!
//! ## Submodules
//!
//! - [`cpu`] — Multi-threaded CPU kernels over flat `f32` slices
//! - [`dispatch`] — Instruction-path selection by [`Precision`](crate::precision::Precision)
//!   and rounding of results onto the storage grid
//!
//! ## Instruction Paths
//!
//! Every kernel computes in `f32`. The reduced path (`f16`/`bf16` inputs) runs
//! the same kernels and rounds each result, so a stage output on that path is
//! exactly what a native half-precision kernel with `f32` accumulation would
//! be allowed to produce.
//!
//! ## Extending
//!
//! To add a new operation:
//!
//! 1. Implement the kernel in `cpu` on flat slices (no validation)
//! 2. Add a `dispatch` wrapper that rounds its results
//! 3. Validate shapes in the stage that calls it
//!
//! ## Notes
//!
//! - Kernels assume validated shapes and may panic on inconsistent sizes
//! - Results never depend on the number of `rayon` threads

pub mod cpu;
pub mod dispatch;
