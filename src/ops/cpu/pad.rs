//! Spatial padding over the trailing axes of a tensor.

use crate::params::PadMode;
use crate::tensors::{flatten, next_index};

/// Source coordinate along one axis of length `n` for padded coordinate `o`.
///
/// `None` means the position is filled with the constant.
#[inline]
fn source(o: usize, before: usize, n: usize, mode: PadMode) -> Option<usize> {
    let i = o as isize - before as isize;
    let len = n as isize;
    match mode {
        PadMode::Constant(_) => (0..len).contains(&i).then_some(i as usize),
        PadMode::Repeat => Some(i.clamp(0, len - 1) as usize),
        PadMode::Reflect => {
            if n == 1 {
                return Some(0);
            }
            let period = 2 * (len - 1);
            let m = i.rem_euclid(period);
            Some(if m < len { m } else { period - m } as usize)
        }
    }
}

/// Maps every output element to its source element (or `None` for fill).
fn source_table(
    in_shape: &[usize],
    widths: &[(usize, usize)],
    mode: PadMode,
) -> Vec<Option<usize>> {
    let lead = in_shape.len() - widths.len();
    let out_shape = output_shape(in_shape, widths);
    let numel: usize = out_shape.iter().product();
    let mut table = Vec::with_capacity(numel);
    if numel == 0 {
        return table;
    }

    let mut idx = vec![0usize; out_shape.len()];
    let mut src = vec![0usize; out_shape.len()];
    loop {
        let mut inside = true;
        for d in 0..idx.len() {
            if d < lead {
                src[d] = idx[d];
            } else {
                let (before, _) = widths[d - lead];
                match source(idx[d], before, in_shape[d], mode) {
                    Some(s) => src[d] = s,
                    None => {
                        inside = false;
                        break;
                    }
                }
            }
        }
        table.push(inside.then(|| flatten(&src, in_shape)));
        if !next_index(&mut idx, &out_shape) {
            break;
        }
    }
    table
}

/// Shape after padding the trailing `widths.len()` axes.
#[must_use]
pub fn output_shape(in_shape: &[usize], widths: &[(usize, usize)]) -> Vec<usize> {
    let lead = in_shape.len() - widths.len();
    in_shape
        .iter()
        .enumerate()
        .map(|(d, &n)| if d < lead { n } else { n + widths[d - lead].0 + widths[d - lead].1 })
        .collect()
}

/// Pads `x` (of shape `in_shape`).
#[must_use]
pub fn pad(x: &[f32], in_shape: &[usize], widths: &[(usize, usize)], mode: PadMode) -> Vec<f32> {
    let fill = match mode {
        PadMode::Constant(v) => v,
        PadMode::Reflect | PadMode::Repeat => 0.0,
    };
    source_table(in_shape, widths, mode)
        .into_iter()
        .map(|s| s.map_or(fill, |i| x[i]))
        .collect()
}

/// Scatters `dy` back onto the unpadded input, summing positions that share a source.
#[must_use]
pub fn pad_backward(
    dy: &[f32],
    in_shape: &[usize],
    widths: &[(usize, usize)],
    mode: PadMode,
) -> Vec<f32> {
    let mut dx = vec![0.0f32; in_shape.iter().product()];
    for (g, s) in dy.iter().zip(source_table(in_shape, widths, mode)) {
        if let Some(i) = s {
            dx[i] += g;
        }
    }
    dx
}
