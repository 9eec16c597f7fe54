//! Grouped, strided, dilated N-dimensional convolution.
//!
//! Layouts (channel-first, outer axes folded into `batch`):
//! - input  `[batch, in_channels, *in_spatial]` (already padded)
//! - weight `[out_channels, in_channels / group, *kernel]`
//! - output `[batch, out_channels, *out_spatial]`

use rayon::prelude::*;

use super::Needs;
use crate::tensors::{flatten, next_index};

/// Resolved sizes of one convolution call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub group: usize,
    pub in_spatial: Vec<usize>,
    pub kernel: Vec<usize>,
    pub out_spatial: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
}

impl ConvGeometry {
    fn in_size(&self) -> usize {
        self.in_spatial.iter().product()
    }

    fn out_size(&self) -> usize {
        self.out_spatial.iter().product()
    }

    fn kernel_size(&self) -> usize {
        self.kernel.iter().product()
    }

    fn in_per_group(&self) -> usize {
        self.in_channels / self.group
    }

    fn out_per_group(&self) -> usize {
        self.out_channels / self.group
    }

    /// Offset into one input plane for every (output position, kernel tap) pair.
    fn taps(&self) -> Vec<usize> {
        let nd = self.in_spatial.len();
        let mut taps = Vec::with_capacity(self.out_size() * self.kernel_size());
        let mut o_idx = vec![0usize; nd];
        let mut in_idx = vec![0usize; nd];
        loop {
            let mut k_idx = vec![0usize; nd];
            loop {
                for d in 0..nd {
                    in_idx[d] = o_idx[d] * self.stride[d] + k_idx[d] * self.dilation[d];
                }
                taps.push(flatten(&in_idx, &self.in_spatial));
                if !next_index(&mut k_idx, &self.kernel) {
                    break;
                }
            }
            if !next_index(&mut o_idx, &self.out_spatial) {
                break;
            }
        }
        taps
    }
}

/// Output length along one axis, or `None` if the kernel does not fit.
///
/// A dilated kernel span that overflows `usize` never fits.
#[must_use]
pub fn output_len(input: usize, kernel: usize, stride: usize, dilation: usize) -> Option<usize> {
    let span = dilation.checked_mul(kernel.checked_sub(1)?)?.checked_add(1)?;
    (input >= span).then(|| (input - span) / stride + 1)
}

/// Forward convolution.
#[must_use]
pub fn conv(x: &[f32], w: &[f32], bias: Option<&[f32]>, g: &ConvGeometry) -> Vec<f32> {
    let in_sp = g.in_size();
    let out_sp = g.out_size();
    let k_sp = g.kernel_size();
    let icg = g.in_per_group();
    let ocg = g.out_per_group();
    let taps = g.taps();

    let mut out = vec![0.0f32; g.batch * g.out_channels * out_sp];
    out.par_chunks_mut(out_sp)
        .enumerate()
        .for_each(|(plane_idx, plane)| {
            let b = plane_idx / g.out_channels;
            let o = plane_idx % g.out_channels;
            let first_in = (o / ocg) * icg;
            let init = bias.map_or(0.0, |bias| bias[o]);

            for (p, y) in plane.iter_mut().enumerate() {
                let tap_row = &taps[p * k_sp..(p + 1) * k_sp];
                let mut acc = init;
                for ic in 0..icg {
                    let x_plane = &x[(b * g.in_channels + first_in + ic) * in_sp..][..in_sp];
                    let w_row = &w[(o * icg + ic) * k_sp..][..k_sp];
                    for (&t, &wv) in tap_row.iter().zip(w_row) {
                        acc += x_plane[t] * wv;
                    }
                }
                *y = acc;
            }
        });
    out
}

/// Gradients produced by [`conv_backward`]; each is `Some` only if requested.
#[derive(Debug, Default)]
pub struct ConvGrads {
    pub dx: Option<Vec<f32>>,
    pub dw: Option<Vec<f32>>,
    pub db: Option<Vec<f32>>,
}

/// Backward convolution.
#[must_use]
pub fn conv_backward(
    x: &[f32],
    w: &[f32],
    dy: &[f32],
    g: &ConvGeometry,
    needs: Needs,
) -> ConvGrads {
    let in_sp = g.in_size();
    let out_sp = g.out_size();
    let k_sp = g.kernel_size();
    let icg = g.in_per_group();
    let ocg = g.out_per_group();
    let taps = if needs.input || needs.weight { g.taps() } else { Vec::new() };

    let db = needs.bias.then(|| {
        (0..g.out_channels)
            .into_par_iter()
            .map(|o| {
                (0..g.batch)
                    .map(|b| dy[(b * g.out_channels + o) * out_sp..][..out_sp].iter().sum::<f32>())
                    .sum::<f32>()
            })
            .collect::<Vec<f32>>()
    });

    // one output channel per chunk
    let dw = needs.weight.then(|| {
        let mut dw = vec![0.0f32; g.out_channels * icg * k_sp];
        dw.par_chunks_mut(icg * k_sp).enumerate().for_each(|(o, dw_o)| {
            let first_in = (o / ocg) * icg;
            for b in 0..g.batch {
                let dy_plane = &dy[(b * g.out_channels + o) * out_sp..][..out_sp];
                for ic in 0..icg {
                    let x_plane = &x[(b * g.in_channels + first_in + ic) * in_sp..][..in_sp];
                    let dw_row = &mut dw_o[ic * k_sp..(ic + 1) * k_sp];
                    for (p, &gy) in dy_plane.iter().enumerate() {
                        let tap_row = &taps[p * k_sp..(p + 1) * k_sp];
                        for (dwv, &t) in dw_row.iter_mut().zip(tap_row) {
                            *dwv += gy * x_plane[t];
                        }
                    }
                }
            }
        });
        dw
    });

    // one batch item per chunk
    let dx = needs.input.then(|| {
        let mut dx = vec![0.0f32; g.batch * g.in_channels * in_sp];
        dx.par_chunks_mut(g.in_channels * in_sp).enumerate().for_each(|(b, dx_b)| {
            for o in 0..g.out_channels {
                let first_in = (o / ocg) * icg;
                let dy_plane = &dy[(b * g.out_channels + o) * out_sp..][..out_sp];
                for ic in 0..icg {
                    let dx_plane = &mut dx_b[(first_in + ic) * in_sp..][..in_sp];
                    let w_row = &w[(o * icg + ic) * k_sp..][..k_sp];
                    for (p, &gy) in dy_plane.iter().enumerate() {
                        let tap_row = &taps[p * k_sp..(p + 1) * k_sp];
                        for (&t, &wv) in tap_row.iter().zip(w_row) {
                            dx_plane[t] += gy * wv;
                        }
                    }
                }
            }
        });
        dx
    });

    ConvGrads { dx, dw, db }
}
