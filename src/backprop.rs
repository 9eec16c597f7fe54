//! Differentiable stage operations.
//!
//! # Unfused Stage API
//!
//! Provides every stage of the fused convolution block as its own operator so
//! the block can also be built as an unfused graph.
//!
//! **Key Features:**
//! - **Padding:** constant, reflect and repeat padding with scatter-add backward.
//! - **Convolution:** grouped, strided, dilated N-d convolution, channel-first or channel-last.
//! - **Batch Normalization:** training and evaluation statistics.
//! - **Residual Addition:** `a + b` with pass-through backward.
//! - **Activation:** the nonlinearity table of [`Activation`].
//!
//! ## Autograd Pattern
//!
//! Each operation follows a simple pattern:
//! 1. **Forward** takes tensors by reference and returns a fresh output.
//! 2. **Backward** takes the same inputs, the output gradient and one
//!    [`GradRequest`] per input, and adds its contribution into every
//!    `Accumulate` buffer.
//! 3. **Validation** happens before anything is written, so a failing call
//!    leaves caller buffers untouched.
//!
//! ## Usage Guidelines
//!
//! - Gradient buffers are accumulated into; zero them to get a fresh gradient.
//! - All inputs (and `dy`) of one call must share a [`Precision`].

use log::debug;

use crate::error::{OpError, Result};
use crate::grad::GradRequest;
use crate::ops::cpu::Needs;
use crate::ops::cpu::norm::NormNeeds;
use crate::params::{Activation, ConvParams, NormParams, PadMode};
use crate::precision::Precision;
use crate::stages::{
    ActivationStage, ConvolutionStage, NormArgs, NormalizationStage, PaddingStage, ResidualStage,
    from_channel_first, to_channel_first,
};
use crate::tensors::Tensor;

/// Pads the trailing `widths.len()` axes of `x`.
///
/// # Example
/// ```rust
/// use briny_kernels::{backprop, params::PadMode, tensor};
///
/// let x = tensor!([[1.0, 2.0, 3.0]]);
/// let y = backprop::pad(&x, &[(2, 0)], PadMode::Reflect).unwrap();
/// assert_eq!(y.data, vec![3.0, 2.0, 1.0, 2.0, 3.0]);
/// ```
pub fn pad(x: &Tensor, widths: &[(usize, usize)], mode: PadMode) -> Result<Tensor> {
    debug!("pad {:?} by {widths:?}", x.shape);
    PaddingStage::new(widths.to_vec(), mode).forward(x)
}

/// Backward of [`pad`]: positions sharing a source are summed.
pub fn pad_backward(
    x: &Tensor,
    widths: &[(usize, usize)],
    mode: PadMode,
    dy: &Tensor,
    dx: &mut GradRequest<'_>,
) -> Result<()> {
    Precision::unify("pad", &[x, dy])?;
    dx.validate("pad", "x", Some(&x.shape))?;
    if !dx.is_requested() {
        return Ok(());
    }
    let grad = PaddingStage::new(widths.to_vec(), mode).backward(&x.shape, dy)?;
    dx.accumulate(&grad)
}

/// Gradient slots of [`convolution_backward`].
#[derive(Debug, Default)]
pub struct ConvGrads<'a> {
    pub x: GradRequest<'a>,
    pub weight: GradRequest<'a>,
    pub bias: GradRequest<'a>,
}

impl ConvGrads<'_> {
    /// `x` and `weight` present but skipped; no bias.
    #[must_use]
    pub fn new() -> Self {
        Self {
            x: GradRequest::Skip,
            weight: GradRequest::Skip,
            bias: GradRequest::Absent,
        }
    }
}

fn spatial_dims(op: &'static str, weight: &Tensor) -> Result<usize> {
    weight
        .ndim()
        .checked_sub(2)
        .ok_or_else(|| {
            OpError::shape(op, format!("weight must have rank >= 2, got {:?}", weight.shape))
        })
}

fn present<'a>(required: &[&'a Tensor], optional: &[Option<&'a Tensor>]) -> Vec<&'a Tensor> {
    required.iter().copied().chain(optional.iter().flatten().copied()).collect()
}

/// Convolution with zero padding by `params.pad_width`.
///
/// # Errors
/// See [`ConvolutionStage::geometry`] and [`ConvParams::pad_pairs`].
///
/// # Example
/// ```rust
/// use briny_kernels::{backprop, params::ConvParams, tensors::Tensor};
///
/// let x = Tensor::zeros(vec![2, 4, 5, 5]);
/// let w = Tensor::zeros(vec![6, 2, 3, 3]);
/// let params = ConvParams::default().with_pad(vec![1, 1]).with_stride(vec![2, 2]).with_group(2);
/// let y = backprop::convolution(&x, &w, None, &params).unwrap();
/// assert_eq!(y.shape, vec![2, 6, 3, 3]);
/// ```
pub fn convolution(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    params: &ConvParams,
) -> Result<Tensor> {
    const OP: &str = "convolution";
    Precision::unify(OP, &present(&[x, weight], &[bias]))?;
    let nd = spatial_dims(OP, weight)?;
    debug!(
        "convolution {:?} * {:?} ({:?}, pad {:?})",
        x.shape, weight.shape, params.layout, params.pad_width
    );

    let padding = PaddingStage::new(params.pad_pairs(nd)?, PadMode::Constant(0.0));
    let conv = ConvolutionStage::from_params(params, nd)?;
    let xc = to_channel_first(OP, x, params.layout, params.base_axis)?;
    let wc = to_channel_first(OP, weight, params.layout, 1)?;

    let padded = padding.forward(&xc)?;
    let y = conv.forward(&padded, &wc, bias)?;
    Ok(from_channel_first(y, params.layout, params.base_axis))
}

/// Backward of [`convolution`].
pub fn convolution_backward(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    params: &ConvParams,
    dy: &Tensor,
    grads: &mut ConvGrads<'_>,
) -> Result<()> {
    const OP: &str = "convolution";
    Precision::unify(OP, &present(&[x, weight, dy], &[bias]))?;
    grads.x.validate(OP, "x", Some(&x.shape))?;
    grads.weight.validate(OP, "weight", Some(&weight.shape))?;
    grads.bias.validate(OP, "bias", bias.map(|b| b.shape.as_slice()))?;
    let needs = Needs {
        input: grads.x.is_requested(),
        weight: grads.weight.is_requested(),
        bias: grads.bias.is_requested(),
    };
    let nd = spatial_dims(OP, weight)?;
    let padding = PaddingStage::new(params.pad_pairs(nd)?, PadMode::Constant(0.0));
    let conv = ConvolutionStage::from_params(params, nd)?;
    let xc = to_channel_first(OP, x, params.layout, params.base_axis)?;
    let wc = to_channel_first(OP, weight, params.layout, 1)?;
    let dyc = to_channel_first(OP, dy, params.layout, params.base_axis)?;
    let padded = padding.forward(&xc)?;
    if !needs.any() {
        // still surfaces shape errors
        conv.geometry(&padded.shape, &wc.shape, bias)?;
        return Ok(());
    }
    debug!("convolution backward {:?} ({needs:?})", dy.shape);

    let g = conv.backward(&padded, &wc, bias, &dyc, needs)?;
    let dx = g
        .dx
        .map(|dx| padding.backward(&xc.shape, &dx))
        .transpose()?
        .map(|dx| from_channel_first(dx, params.layout, params.base_axis));
    let dw = g.dw.map(|dw| from_channel_first(dw, params.layout, 1));

    if let Some(dx) = dx {
        grads.x.accumulate(&dx)?;
    }
    if let Some(dw) = dw {
        grads.weight.accumulate(&dw)?;
    }
    if let Some(db) = g.db {
        grads.bias.accumulate(&db)?;
    }
    Ok(())
}

/// Batch normalization over `params.axis`.
///
/// In training mode the running statistics are updated in place after the
/// output has been computed; in evaluation mode they are only read.
pub fn batch_normalization(
    x: &Tensor,
    beta: &Tensor,
    gamma: &Tensor,
    running_mean: &mut Tensor,
    running_var: &mut Tensor,
    params: &NormParams,
) -> Result<Tensor> {
    Precision::unify(
        "batch_normalization",
        &[x, beta, gamma, &*running_mean, &*running_var],
    )?;
    debug!(
        "batch_normalization {:?} axis {} ({:?})",
        x.shape, params.axis, params.batch_stat
    );
    let stage = NormalizationStage::new(*params);
    let args = NormArgs {
        beta,
        gamma,
        running_mean: &*running_mean,
        running_var: &*running_var,
    };
    let (y, stats) = stage.forward(x, args)?;
    stage.update_running(&stats, running_mean, running_var);
    Ok(y)
}

/// Gradient slots of [`batch_normalization_backward`].
#[derive(Debug, Default)]
pub struct BatchNormGrads<'a> {
    pub x: GradRequest<'a>,
    pub beta: GradRequest<'a>,
    pub gamma: GradRequest<'a>,
    /// Only valid in evaluation mode.
    pub running_mean: GradRequest<'a>,
    /// Only valid in evaluation mode.
    pub running_var: GradRequest<'a>,
}

impl BatchNormGrads<'_> {
    /// Every input present, nothing requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            x: GradRequest::Skip,
            beta: GradRequest::Skip,
            gamma: GradRequest::Skip,
            running_mean: GradRequest::Skip,
            running_var: GradRequest::Skip,
        }
    }
}

/// Backward of [`batch_normalization`]; running statistics are not updated.
#[allow(clippy::too_many_arguments)]
pub fn batch_normalization_backward(
    x: &Tensor,
    beta: &Tensor,
    gamma: &Tensor,
    running_mean: &Tensor,
    running_var: &Tensor,
    params: &NormParams,
    dy: &Tensor,
    grads: &mut BatchNormGrads<'_>,
) -> Result<()> {
    const OP: &str = "batch_normalization";
    Precision::unify(OP, &[x, beta, gamma, running_mean, running_var, dy])?;
    grads.x.validate(OP, "x", Some(&x.shape))?;
    grads.beta.validate(OP, "beta", Some(&beta.shape))?;
    grads.gamma.validate(OP, "gamma", Some(&gamma.shape))?;
    grads.running_mean.validate(OP, "running mean", Some(&running_mean.shape))?;
    grads.running_var.validate(OP, "running variance", Some(&running_var.shape))?;
    let needs = NormNeeds {
        x: grads.x.is_requested(),
        beta: grads.beta.is_requested(),
        gamma: grads.gamma.is_requested(),
        mean: grads.running_mean.is_requested(),
        var: grads.running_var.is_requested(),
    };
    let args = NormArgs {
        beta,
        gamma,
        running_mean,
        running_var,
    };
    let g = NormalizationStage::new(*params).backward(x, args, dy, needs)?;

    for (slot, grad) in [
        (&mut grads.x, g.dx),
        (&mut grads.beta, g.dbeta),
        (&mut grads.gamma, g.dgamma),
        (&mut grads.running_mean, g.dmean),
        (&mut grads.running_var, g.dvar),
    ] {
        if let Some(grad) = grad {
            slot.accumulate(&grad)?;
        }
    }
    Ok(())
}

/// Elementwise `a + b`; shapes must match exactly.
pub fn add2(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    Precision::unify("add2", &[a, b])?;
    ResidualStage.forward(a, b)
}

/// Backward of [`add2`]: both operands receive `dy`.
pub fn add2_backward(
    a: &Tensor,
    b: &Tensor,
    dy: &Tensor,
    da: &mut GradRequest<'_>,
    db: &mut GradRequest<'_>,
) -> Result<()> {
    Precision::unify("add2", &[a, b, dy])?;
    if a.shape != b.shape {
        return Err(OpError::shapes("add2", "rhs", &a.shape, &b.shape));
    }
    if dy.shape != a.shape {
        return Err(OpError::shapes("add2", "output gradient", &a.shape, &dy.shape));
    }
    da.validate("add2", "a", Some(&a.shape))?;
    db.validate("add2", "b", Some(&b.shape))?;
    let (ga, gb) = ResidualStage.backward(dy);
    da.accumulate(&ga)?;
    db.accumulate(&gb)
}

/// Applies `f` elementwise.
#[must_use]
pub fn activation(x: &Tensor, f: Activation) -> Tensor {
    ActivationStage::new(f).forward(x)
}

/// Backward of [`activation`], recomputing the forward output.
pub fn activation_backward(
    x: &Tensor,
    f: Activation,
    dy: &Tensor,
    dx: &mut GradRequest<'_>,
) -> Result<()> {
    Precision::unify("activation", &[x, dy])?;
    dx.validate("activation", "x", Some(&x.shape))?;
    if !dx.is_requested() {
        return Ok(());
    }
    let stage = ActivationStage::new(f);
    let y = stage.forward(x);
    let grad = stage.backward(x, &y, dy)?;
    dx.accumulate(&grad)
}
