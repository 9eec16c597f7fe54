//! Batch normalization over one channel axis.
//!
//! Tensors are viewed as `[outer, channels, inner]`; statistics for channel
//! `c` cover every `(outer, inner)` position. Reductions accumulate in `f64`.

use rayon::prelude::*;

/// `[outer, channels, inner]` view of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormGeometry {
    pub outer: usize,
    pub channels: usize,
    pub inner: usize,
}

impl NormGeometry {
    /// Splits `shape` around `axis`.
    #[must_use]
    pub fn around(shape: &[usize], axis: usize) -> Self {
        Self {
            outer: shape[..axis].iter().product(),
            channels: shape[axis],
            inner: shape[axis + 1..].iter().product(),
        }
    }

    /// Elements per channel.
    #[must_use]
    pub fn count(&self) -> usize {
        self.outer * self.inner
    }

    /// Calls `f(flat_index)` for every element of channel `c`.
    #[inline]
    fn for_channel(&self, c: usize, mut f: impl FnMut(usize)) {
        for o in 0..self.outer {
            let base = (o * self.channels + c) * self.inner;
            for i in base..base + self.inner {
                f(i);
            }
        }
    }
}

/// Per-channel mean and biased variance of `x`.
#[must_use]
pub fn batch_stats(x: &[f32], g: NormGeometry) -> (Vec<f32>, Vec<f32>) {
    let n = g.count().max(1) as f64;
    (0..g.channels)
        .into_par_iter()
        .map(|c| {
            let mut sum = 0.0f64;
            g.for_channel(c, |i| sum += f64::from(x[i]));
            let mean = sum / n;
            let mut sq = 0.0f64;
            g.for_channel(c, |i| {
                let d = f64::from(x[i]) - mean;
                sq += d * d;
            });
            (mean as f32, (sq / n) as f32)
        })
        .unzip()
}

/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`.
#[must_use]
pub fn normalize(
    x: &[f32],
    g: NormGeometry,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
    beta: &[f32],
    eps: f32,
) -> Vec<f32> {
    let mut y = vec![0.0f32; x.len()];
    for c in 0..g.channels {
        let inv = 1.0 / (var[c] + eps).sqrt();
        let scale = gamma[c] * inv;
        g.for_channel(c, |i| y[i] = (x[i] - mean[c]) * scale + beta[c]);
    }
    y
}

/// Folds batch statistics into running statistics.
///
/// The running variance receives the unbiased estimate `var * n / (n - 1)`.
pub fn update_running(
    running_mean: &mut [f32],
    running_var: &mut [f32],
    mean: &[f32],
    var: &[f32],
    count: usize,
    decay_rate: f32,
) {
    let correction = if count > 1 {
        count as f32 / (count - 1) as f32
    } else {
        1.0
    };
    for c in 0..mean.len() {
        running_mean[c] = decay_rate * running_mean[c] + (1.0 - decay_rate) * mean[c];
        running_var[c] = decay_rate * running_var[c] + (1.0 - decay_rate) * var[c] * correction;
    }
}

/// Which normalization gradients to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormNeeds {
    pub x: bool,
    pub beta: bool,
    pub gamma: bool,
    pub mean: bool,
    pub var: bool,
}

/// Normalization gradients; each is `Some` only if requested.
#[derive(Debug, Default)]
pub struct NormGrads {
    pub dx: Option<Vec<f32>>,
    pub dbeta: Option<Vec<f32>>,
    pub dgamma: Option<Vec<f32>>,
    pub dmean: Option<Vec<f32>>,
    pub dvar: Option<Vec<f32>>,
}

/// Per-channel `(sum dy, sum dy * xhat)`.
fn reductions(
    x: &[f32],
    dy: &[f32],
    g: NormGeometry,
    mean: &[f32],
    inv: &[f32],
) -> Vec<(f64, f64)> {
    (0..g.channels)
        .into_par_iter()
        .map(|c| {
            let (mut s, mut sx) = (0.0f64, 0.0f64);
            g.for_channel(c, |i| {
                let xhat = f64::from((x[i] - mean[c]) * inv[c]);
                s += f64::from(dy[i]);
                sx += f64::from(dy[i]) * xhat;
            });
            (s, sx)
        })
        .collect()
}

fn inv_std(var: &[f32], eps: f32) -> Vec<f32> {
    var.iter().map(|v| 1.0 / (v + eps).sqrt()).collect()
}

/// Backward through batch statistics (training mode).
///
/// `mean`/`var` are the batch statistics used in the forward pass.
#[must_use]
pub fn backward_batch(
    x: &[f32],
    dy: &[f32],
    g: NormGeometry,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
    eps: f32,
    needs: NormNeeds,
) -> NormGrads {
    let inv = inv_std(var, eps);
    let red = reductions(x, dy, g, mean, &inv);
    let n = g.count() as f64;

    let dx = needs.x.then(|| {
        let mut dx = vec![0.0f32; x.len()];
        for c in 0..g.channels {
            let (s, sx) = red[c];
            let k = f64::from(gamma[c]) * f64::from(inv[c]) / n;
            g.for_channel(c, |i| {
                let xhat = f64::from((x[i] - mean[c]) * inv[c]);
                dx[i] = (k * (n * f64::from(dy[i]) - s - xhat * sx)) as f32;
            });
        }
        dx
    });

    NormGrads {
        dx,
        dbeta: needs.beta.then(|| red.iter().map(|r| r.0 as f32).collect()),
        dgamma: needs.gamma.then(|| red.iter().map(|r| r.1 as f32).collect()),
        dmean: None,
        dvar: None,
    }
}

/// Backward with fixed running statistics (evaluation mode).
///
/// The running mean and variance are differentiable inputs here.
#[must_use]
pub fn backward_running(
    x: &[f32],
    dy: &[f32],
    g: NormGeometry,
    mean: &[f32],
    var: &[f32],
    gamma: &[f32],
    eps: f32,
    needs: NormNeeds,
) -> NormGrads {
    let inv = inv_std(var, eps);
    let red = reductions(x, dy, g, mean, &inv);

    let dx = needs.x.then(|| {
        let mut dx = vec![0.0f32; x.len()];
        for c in 0..g.channels {
            let scale = gamma[c] * inv[c];
            g.for_channel(c, |i| dx[i] = dy[i] * scale);
        }
        dx
    });

    // d/dvar of (x - m) * (v + eps)^-1/2 is -1/2 (x - m) (v + eps)^-3/2 = -1/2 xhat / (v + eps)
    let dvar = needs.var.then(|| {
        (0..g.channels)
            .map(|c| {
                let inv2 = f64::from(inv[c]) * f64::from(inv[c]);
                (-0.5 * f64::from(gamma[c]) * red[c].1 * inv2) as f32
            })
            .collect()
    });

    NormGrads {
        dx,
        dbeta: needs.beta.then(|| red.iter().map(|r| r.0 as f32).collect()),
        dgamma: needs.gamma.then(|| red.iter().map(|r| r.1 as f32).collect()),
        dmean: needs
            .mean
            .then(|| (0..g.channels).map(|c| -gamma[c] * inv[c] * red[c].0 as f32).collect()),
        dvar,
    }
}
