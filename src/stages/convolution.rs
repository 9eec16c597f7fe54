//! Grouped, strided, dilated convolution stage.
//!
//! The input is channel-first: `[*outer, C_in, *spatial]` with the channel
//! axis at `base_axis`. Every axis before `base_axis` is folded into a batch
//! axis. The weight is `[C_out, C_in / group, *kernel]`.
//!
//! Output spatial sizes follow `floor((in - 1 - d * (k - 1)) / s) + 1` over the
//! (already padded) input.

use log::trace;

use crate::error::{OpError, Result};
use crate::ops::cpu::{Needs, conv};
use crate::ops::dispatch::{self, Path};
use crate::params::ConvParams;
use crate::tensors::Tensor;

/// Convolution without padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionStage {
    pub base_axis: usize,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    pub group: usize,
}

/// Gradients of one convolution backward; each is `Some` only if requested.
#[derive(Debug, Default)]
pub struct ConvStageGrads {
    pub dx: Option<Tensor>,
    pub dw: Option<Tensor>,
    pub db: Option<Tensor>,
}

impl ConvolutionStage {
    /// Resolves `params` for a convolution with `spatial_dims` spatial axes.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] for a zero group count or malformed
    /// stride/dilation lists.
    pub fn from_params(params: &ConvParams, spatial_dims: usize) -> Result<Self> {
        if params.group == 0 {
            return Err(OpError::invalid("convolution", "group must be >= 1"));
        }
        Ok(Self {
            base_axis: params.base_axis,
            stride: params.strides_for(spatial_dims)?,
            dilation: params.dilations_for(spatial_dims)?,
            group: params.group,
        })
    }

    /// Validates `x`, `w` and `bias` against each other and resolves sizes.
    ///
    /// # Errors
    /// [`OpError::ShapeMismatch`] for rank or channel mismatches, channel
    /// counts not divisible by `group`, kernels that do not fit the input, or
    /// a bias without one element per output channel.
    pub fn geometry(
        &self,
        x: &[usize],
        w: &[usize],
        bias: Option<&Tensor>,
    ) -> Result<conv::ConvGeometry> {
        const OP: &str = "convolution";
        if w.len() < 2 {
            return Err(OpError::shape(OP, format!("weight must have rank >= 2, got {w:?}")));
        }
        let nd = w.len() - 2;
        if self.stride.len() != nd || self.dilation.len() != nd {
            return Err(OpError::invalid(
                OP,
                format!("stride/dilation do not cover {nd} spatial dims"),
            ));
        }
        if x.len().checked_sub(nd + 1) != Some(self.base_axis) {
            return Err(OpError::shape(
                OP,
                format!(
                    "input {x:?} with base axis {} does not match a {nd}-d kernel",
                    self.base_axis
                ),
            ));
        }

        let in_channels = x[self.base_axis];
        let (out_channels, per_group) = (w[0], w[1]);
        if per_group.checked_mul(self.group) != Some(in_channels) {
            return Err(OpError::shape(
                OP,
                format!(
                    "{in_channels} input channels vs weight {w:?} with {} groups",
                    self.group
                ),
            ));
        }
        if out_channels % self.group != 0 {
            return Err(OpError::shape(
                OP,
                format!("{out_channels} output channels not divisible by {} groups", self.group),
            ));
        }
        if per_group == 0 || out_channels == 0 {
            return Err(OpError::shape(OP, "channel counts must be non-zero"));
        }

        let in_spatial = x[self.base_axis + 1..].to_vec();
        let kernel = w[2..].to_vec();
        let mut out_spatial = Vec::with_capacity(nd);
        for d in 0..nd {
            let len = conv::output_len(in_spatial[d], kernel[d], self.stride[d], self.dilation[d])
                .ok_or_else(|| {
                    OpError::shape(
                        OP,
                        format!(
                            "kernel {} (dilation {}) does not fit input length {} on axis {d}",
                            kernel[d], self.dilation[d], in_spatial[d]
                        ),
                    )
                })?;
            out_spatial.push(len);
        }

        if let Some(b) = bias {
            if b.numel() != out_channels {
                return Err(OpError::shape(
                    OP,
                    format!("bias {:?} for {out_channels} output channels", b.shape),
                ));
            }
        }

        Ok(conv::ConvGeometry {
            batch: x[..self.base_axis].iter().product(),
            in_channels,
            out_channels,
            group: self.group,
            in_spatial,
            kernel,
            out_spatial,
            stride: self.stride.clone(),
            dilation: self.dilation.clone(),
        })
    }

    fn output_shape(&self, x: &[usize], g: &conv::ConvGeometry) -> Vec<usize> {
        let mut shape = x[..self.base_axis].to_vec();
        shape.push(g.out_channels);
        shape.extend_from_slice(&g.out_spatial);
        shape
    }

    pub fn forward(&self, x: &Tensor, w: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let g = self.geometry(&x.shape, &w.shape, bias)?;
        let shape = self.output_shape(&x.shape, &g);
        trace!(
            "convolution {:?} * {:?} -> {:?} (stride {:?}, dilation {:?}, group {})",
            x.shape, w.shape, shape, self.stride, self.dilation, self.group
        );
        let path = Path::of(x.precision);
        let data = dispatch::conv(path, &x.data, &w.data, bias.map(|b| b.data.as_slice()), &g);
        Ok(Tensor::new(shape, data).with_precision(path.precision()))
    }

    /// Gradients for the inputs selected by `needs`.
    ///
    /// `needs.bias` is ignored when `bias` is `None`.
    pub fn backward(
        &self,
        x: &Tensor,
        w: &Tensor,
        bias: Option<&Tensor>,
        dy: &Tensor,
        needs: Needs,
    ) -> Result<ConvStageGrads> {
        let g = self.geometry(&x.shape, &w.shape, bias)?;
        let expected = self.output_shape(&x.shape, &g);
        if dy.shape != expected {
            return Err(OpError::shapes("convolution", "output gradient", &expected, &dy.shape));
        }
        let needs = Needs {
            bias: needs.bias && bias.is_some(),
            ..needs
        };
        trace!("convolution backward {:?} ({needs:?})", dy.shape);

        let path = Path::of(dy.precision);
        let grads = dispatch::conv_backward(path, &x.data, &w.data, &dy.data, &g, needs);
        let p = path.precision();
        Ok(ConvStageGrads {
            dx: grads.dx.map(|d| Tensor::new(x.shape.clone(), d).with_precision(p)),
            dw: grads.dw.map(|d| Tensor::new(w.shape.clone(), d).with_precision(p)),
            db: grads
                .db
                .zip(bias)
                .map(|(d, b)| Tensor::new(b.shape.clone(), d).with_precision(p)),
        })
    }
}
