//! Stages of the fused convolution block.
//!
//! Each stage validates its own inputs, works on channel-first tensors, and
//! exposes a `forward` producing a fresh tensor plus a `backward` that maps an
//! output gradient to the gradients its caller asked for. Stage outputs and
//! gradients are finished on the instruction path of their input (see
//! [`ops::dispatch`](crate::ops::dispatch)).
//!
//! The stages never touch caller-owned gradient buffers; operators collect
//! their results and accumulate them once everything succeeded.

use std::borrow::Cow;

use crate::error::{OpError, Result};
use crate::params::Layout;
use crate::tensors::Tensor;

pub mod activation;
pub mod convolution;
pub mod normalization;
pub mod padding;
pub mod residual;

pub use activation::ActivationStage;
pub use convolution::{ConvStageGrads, ConvolutionStage};
pub use normalization::{NormArgs, NormStageGrads, NormStats, NormalizationStage};
pub use padding::PaddingStage;
pub use residual::ResidualStage;

/// Views `t` with its channel axis at `axis`.
///
/// Channel-last tensors keep channels on their last axis.
pub(crate) fn to_channel_first<'a>(
    op: &'static str,
    t: &'a Tensor,
    layout: Layout,
    axis: usize,
) -> Result<Cow<'a, Tensor>> {
    if axis >= t.ndim() {
        return Err(OpError::invalid(
            op,
            format!("channel axis {axis} out of range for rank {}", t.ndim()),
        ));
    }
    Ok(match layout {
        Layout::ChannelFirst => Cow::Borrowed(t),
        Layout::ChannelLast => Cow::Owned(t.move_axis(t.ndim() - 1, axis)),
    })
}

/// Inverse of [`to_channel_first`].
pub(crate) fn from_channel_first(t: Tensor, layout: Layout, axis: usize) -> Tensor {
    match layout {
        Layout::ChannelFirst => t,
        Layout::ChannelLast => {
            let last = t.ndim() - 1;
            t.move_axis(axis, last)
        }
    }
}

/// Number of elements of a per-channel parameter, checked against `channels`.
pub(crate) fn check_per_channel(
    op: &'static str,
    name: &str,
    t: &Tensor,
    channels: usize,
) -> Result<()> {
    if t.numel() == channels {
        Ok(())
    } else {
        Err(OpError::shape(
            op,
            format!(
                "{name} has {} elements for {channels} channels (shape {:?})",
                t.numel(),
                t.shape
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_round_trip() {
        let t = Tensor::new(vec![1, 2, 3], (0..6).map(|v| v as f32).collect());
        let cf = to_channel_first("t", &t, Layout::ChannelLast, 1).unwrap().into_owned();
        assert_eq!(cf.shape, vec![1, 3, 2]);
        assert_eq!(from_channel_first(cf, Layout::ChannelLast, 1), t);

        let same = to_channel_first("t", &t, Layout::ChannelFirst, 1).unwrap();
        assert!(matches!(same, Cow::Borrowed(_)));
        assert!(to_channel_first("t", &t, Layout::ChannelFirst, 3).is_err());
    }
}
