//! Fused convolution block.
//!
//! # Fused Convolution
//!
//! One operator computing
//!
//! ```text
//! pad -> convolution -> [batch_normalization] -> [add2] -> activation
//! ```
//!
//! with a single forward and a single backward pass. The optional stages are
//! present exactly when their inputs are: normalization needs beta, gamma and
//! both running statistics; the residual addition needs the residual tensor.
//!
//! ## Pipeline
//!
//! The block is an ordered list of tagged stages built from the configuration
//! and the inputs. Forward runs the list front to back and keeps every stage
//! input; backward walks it in reverse. Upstream gradients are only computed
//! while some earlier stage (or `x`) still wants one, so a call that asks for
//! the weight gradient alone never materializes the input gradient.
//!
//! ## Gradient Slots
//!
//! [`FusedGrads`] has one [`GradRequest`] per input. A slot must be
//! [`GradRequest::Absent`] exactly when its input is absent; gradients are
//! added into `Accumulate` buffers after the whole backward succeeded.
//!
//! ## Layout
//!
//! Channel-last inputs are permuted to channel-first at entry (`x` and the
//! residual move their last axis to `base_axis`, the weight moves its last
//! axis to 1). Outputs and gradients are permuted back.
//!
//! ## Example
//!
//! ```rust
//! use briny_kernels::fused::{FusedConvolution, FusedGrads, FusedInputs, NormTensors};
//! use briny_kernels::params::{Activation, ConvParams, FusedConvConfig};
//! use briny_kernels::tensors::Tensor;
//!
//! let x = Tensor::full(vec![2, 4, 5, 5], 0.5);
//! let w = Tensor::full(vec![6, 2, 3, 3], 0.1);
//! let (beta, gamma) = (Tensor::zeros(vec![6]), Tensor::full(vec![6], 1.0));
//! let (mut mean, mut var) = (Tensor::zeros(vec![6]), Tensor::full(vec![6], 1.0));
//!
//! let config = FusedConvConfig::default()
//!     .with_conv(ConvParams::default().with_pad(vec![1, 1]).with_stride(vec![2, 2]).with_group(2))
//!     .with_activation(Activation::Relu);
//! let op = FusedConvolution::new(config);
//!
//! let mut inputs = FusedInputs::new(&x, &w).with_norm(NormTensors {
//!     beta: &beta,
//!     gamma: &gamma,
//!     running_mean: &mut mean,
//!     running_var: &mut var,
//! });
//! let y = op.forward(&mut inputs).unwrap();
//! assert_eq!(y.shape, vec![2, 6, 3, 3]);
//!
//! let mut dw = Tensor::zeros(w.shape.clone());
//! let mut grads = FusedGrads::for_inputs(&inputs);
//! grads.weight = (&mut dw).into();
//! op.backward(&inputs, &Tensor::full(y.shape.clone(), 1.0), &mut grads).unwrap();
//! assert!(dw.is_finite());
//! ```

use std::borrow::Cow;

use log::{debug, trace};

use crate::error::{OpError, Result};
use crate::grad::GradRequest;
use crate::ops::cpu::Needs;
use crate::ops::cpu::norm::NormNeeds;
use crate::params::{BatchStat, FusedConvConfig};
use crate::precision::Precision;
use crate::stages::{
    ActivationStage, ConvolutionStage, NormArgs, NormStats, NormalizationStage, PaddingStage,
    ResidualStage, from_channel_first, to_channel_first,
};
use crate::tensors::Tensor;

const OP: &str = "fused_convolution";

/// Normalization inputs; always supplied together.
#[derive(Debug)]
pub struct NormTensors<'a> {
    pub beta: &'a Tensor,
    pub gamma: &'a Tensor,
    /// Updated in place by a training-mode forward.
    pub running_mean: &'a mut Tensor,
    /// Updated in place by a training-mode forward.
    pub running_var: &'a mut Tensor,
}

/// Inputs of one fused convolution call.
#[derive(Debug)]
pub struct FusedInputs<'a> {
    pub x: &'a Tensor,
    pub weight: &'a Tensor,
    pub bias: Option<&'a Tensor>,
    pub norm: Option<NormTensors<'a>>,
    pub residual: Option<&'a Tensor>,
}

impl<'a> FusedInputs<'a> {
    /// Input and weight only: no bias, normalization or residual.
    #[must_use]
    pub fn new(x: &'a Tensor, weight: &'a Tensor) -> Self {
        Self {
            x,
            weight,
            bias: None,
            norm: None,
            residual: None,
        }
    }

    #[must_use]
    pub fn with_bias(mut self, bias: &'a Tensor) -> Self {
        self.bias = Some(bias);
        self
    }

    #[must_use]
    pub fn with_norm(mut self, norm: NormTensors<'a>) -> Self {
        self.norm = Some(norm);
        self
    }

    #[must_use]
    pub fn with_residual(mut self, residual: &'a Tensor) -> Self {
        self.residual = Some(residual);
        self
    }

    /// Builds the inputs from independently optional tensors.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] unless the four normalization tensors are
    /// all present or all absent.
    #[allow(clippy::too_many_arguments)]
    pub fn from_optional(
        x: &'a Tensor,
        weight: &'a Tensor,
        bias: Option<&'a Tensor>,
        beta: Option<&'a Tensor>,
        gamma: Option<&'a Tensor>,
        running_mean: Option<&'a mut Tensor>,
        running_var: Option<&'a mut Tensor>,
        residual: Option<&'a Tensor>,
    ) -> Result<Self> {
        let norm = match (beta, gamma, running_mean, running_var) {
            (Some(beta), Some(gamma), Some(running_mean), Some(running_var)) => Some(NormTensors {
                beta,
                gamma,
                running_mean,
                running_var,
            }),
            (None, None, None, None) => None,
            (beta, gamma, mean, var) => {
                return Err(OpError::invalid(
                    OP,
                    format!(
                        "normalization tensors must be given together \
                         (beta: {}, gamma: {}, running mean: {}, running variance: {})",
                        beta.is_some(),
                        gamma.is_some(),
                        mean.is_some(),
                        var.is_some()
                    ),
                ));
            }
        };
        Ok(Self {
            x,
            weight,
            bias,
            norm,
            residual,
        })
    }

    fn tensors(&self) -> Vec<&Tensor> {
        let mut all = vec![self.x, self.weight];
        all.extend(self.bias);
        if let Some(n) = &self.norm {
            all.extend([n.beta, n.gamma, &*n.running_mean, &*n.running_var]);
        }
        all.extend(self.residual);
        all
    }

    fn norm_args(&self) -> Option<NormArgs<'_>> {
        self.norm.as_ref().map(|n| NormArgs {
            beta: n.beta,
            gamma: n.gamma,
            running_mean: &*n.running_mean,
            running_var: &*n.running_var,
        })
    }
}

/// Gradient slots, one per input of [`FusedInputs`].
#[derive(Debug, Default)]
pub struct FusedGrads<'a> {
    pub x: GradRequest<'a>,
    pub weight: GradRequest<'a>,
    pub bias: GradRequest<'a>,
    pub beta: GradRequest<'a>,
    pub gamma: GradRequest<'a>,
    /// Only valid with evaluation-mode statistics.
    pub running_mean: GradRequest<'a>,
    /// Only valid with evaluation-mode statistics.
    pub running_var: GradRequest<'a>,
    pub residual: GradRequest<'a>,
}

impl FusedGrads<'_> {
    /// `x` and `weight` skipped, every optional input absent.
    #[must_use]
    pub fn new() -> Self {
        Self {
            x: GradRequest::Skip,
            weight: GradRequest::Skip,
            ..Self::default()
        }
    }

    /// `Skip` for every input present in `inputs`, `Absent` for the rest.
    #[must_use]
    pub fn for_inputs(inputs: &FusedInputs<'_>) -> Self {
        let slot = |present: bool| {
            if present {
                GradRequest::Skip
            } else {
                GradRequest::Absent
            }
        };
        let norm = inputs.norm.is_some();
        Self {
            x: GradRequest::Skip,
            weight: GradRequest::Skip,
            bias: slot(inputs.bias.is_some()),
            beta: slot(norm),
            gamma: slot(norm),
            running_mean: slot(norm),
            running_var: slot(norm),
            residual: slot(inputs.residual.is_some()),
        }
    }

    fn validate(&self, inputs: &FusedInputs<'_>, batch_stat: BatchStat) -> Result<()> {
        let norm = inputs.norm.as_ref();
        self.x.validate(OP, "x", Some(&inputs.x.shape))?;
        self.weight.validate(OP, "weight", Some(&inputs.weight.shape))?;
        self.bias.validate(OP, "bias", inputs.bias.map(|b| b.shape.as_slice()))?;
        self.beta.validate(OP, "beta", norm.map(|n| n.beta.shape.as_slice()))?;
        self.gamma.validate(OP, "gamma", norm.map(|n| n.gamma.shape.as_slice()))?;
        self.running_mean
            .validate(OP, "running mean", norm.map(|n| n.running_mean.shape.as_slice()))?;
        self.running_var
            .validate(OP, "running variance", norm.map(|n| n.running_var.shape.as_slice()))?;
        self.residual
            .validate(OP, "residual", inputs.residual.map(|r| r.shape.as_slice()))?;
        if batch_stat == BatchStat::Train
            && (self.running_mean.is_requested() || self.running_var.is_requested())
        {
            return Err(OpError::invalid(
                OP,
                "running statistics have no gradient when batch statistics are used",
            ));
        }
        Ok(())
    }

    fn wants(&self) -> Wants {
        Wants {
            x: self.x.is_requested(),
            weight: self.weight.is_requested(),
            bias: self.bias.is_requested(),
            beta: self.beta.is_requested(),
            gamma: self.gamma.is_requested(),
            mean: self.running_mean.is_requested(),
            var: self.running_var.is_requested(),
            residual: self.residual.is_requested(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[allow(clippy::struct_excessive_bools)]
struct Wants {
    x: bool,
    weight: bool,
    bias: bool,
    beta: bool,
    gamma: bool,
    mean: bool,
    var: bool,
    residual: bool,
}

/// Gradients produced by one backward pass, in channel-first layout.
#[derive(Debug, Default)]
struct Collected {
    x: Option<Tensor>,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
    beta: Option<Tensor>,
    gamma: Option<Tensor>,
    mean: Option<Tensor>,
    var: Option<Tensor>,
    residual: Option<Tensor>,
}

enum Stage<'t> {
    Padding(PaddingStage),
    Convolution {
        stage: ConvolutionStage,
        weight: &'t Tensor,
        bias: Option<&'t Tensor>,
    },
    Normalization {
        stage: NormalizationStage,
        args: NormArgs<'t>,
    },
    Residual {
        z: &'t Tensor,
    },
    Activation(ActivationStage),
}

impl Stage<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Padding(_) => "pad",
            Self::Convolution { .. } => "convolution",
            Self::Normalization { .. } => "batch_normalization",
            Self::Residual { .. } => "add2",
            Self::Activation(a) => a.activation.tag(),
        }
    }

    /// Whether a parameter owned by this stage wants a gradient.
    fn wants_params(&self, w: Wants) -> bool {
        match self {
            Self::Convolution { .. } => w.weight || w.bias,
            Self::Normalization { .. } => w.beta || w.gamma || w.mean || w.var,
            Self::Residual { .. } => w.residual,
            Self::Padding(_) | Self::Activation(_) => false,
        }
    }

    fn forward(&self, x: &Tensor, stats: &mut Option<NormStats>) -> Result<Tensor> {
        match self {
            Self::Padding(p) => p.forward(x),
            Self::Convolution { stage, weight, bias } => stage.forward(x, weight, *bias),
            Self::Normalization { stage, args } => {
                let (y, s) = stage.forward(x, *args)?;
                *stats = Some(s);
                Ok(y)
            }
            Self::Residual { z } => ResidualStage.forward(x, z),
            Self::Activation(a) => Ok(a.forward(x)),
        }
    }

    /// Maps `dy` to the gradient of this stage's input (if `upstream`),
    /// storing parameter gradients in `out`.
    fn backward(
        &self,
        x: &Tensor,
        y: &Tensor,
        dy: Tensor,
        upstream: bool,
        w: Wants,
        out: &mut Collected,
    ) -> Result<Option<Tensor>> {
        match self {
            Self::Padding(p) => upstream.then(|| p.backward(&x.shape, &dy)).transpose(),
            Self::Convolution { stage, weight, bias } => {
                let needs = Needs {
                    input: upstream,
                    weight: w.weight,
                    bias: w.bias,
                };
                let g = stage.backward(x, weight, *bias, &dy, needs)?;
                out.weight = g.dw;
                out.bias = g.db;
                Ok(g.dx)
            }
            Self::Normalization { stage, args } => {
                let needs = NormNeeds {
                    x: upstream,
                    beta: w.beta,
                    gamma: w.gamma,
                    mean: w.mean,
                    var: w.var,
                };
                let g = stage.backward(x, *args, &dy, needs)?;
                out.beta = g.dbeta;
                out.gamma = g.dgamma;
                out.mean = g.dmean;
                out.var = g.dvar;
                Ok(g.dx)
            }
            Self::Residual { .. } => {
                let (dh, dz) = ResidualStage.backward(&dy);
                if w.residual {
                    out.residual = Some(dz);
                }
                Ok(upstream.then_some(dh))
            }
            Self::Activation(a) => upstream.then(|| a.backward(x, y, &dy)).transpose(),
        }
    }
}

/// Stage inputs of one forward pass plus its output.
struct Trace {
    /// `saved[i]` is the input of stage `i`; the last entry is the output.
    saved: Vec<Tensor>,
    stats: Option<NormStats>,
}

struct Pipeline<'t> {
    stages: Vec<Stage<'t>>,
}

impl Pipeline<'_> {
    fn describe(&self) -> String {
        self.stages.iter().map(Stage::name).collect::<Vec<_>>().join(" -> ")
    }

    fn run(&self, x: &Tensor) -> Result<Trace> {
        let mut saved = Vec::with_capacity(self.stages.len() + 1);
        saved.push(x.clone());
        let mut stats = None;
        for (i, stage) in self.stages.iter().enumerate() {
            trace!("forward stage {i}: {}", stage.name());
            let y = stage.forward(&saved[i], &mut stats)?;
            saved.push(y);
        }
        Ok(Trace { saved, stats })
    }

    fn backward(&self, trace: &Trace, dy: Tensor, w: Wants) -> Result<Collected> {
        // upstream[i]: whether anything before stage i needs a gradient
        let mut upstream = Vec::with_capacity(self.stages.len());
        let mut any = w.x;
        for stage in &self.stages {
            upstream.push(any);
            any |= stage.wants_params(w);
        }

        let mut out = Collected::default();
        let mut grad = Some(dy);
        for (i, stage) in self.stages.iter().enumerate().rev() {
            let Some(dy) = grad.take() else { break };
            trace!("backward stage {i}: {} (upstream {})", stage.name(), upstream[i]);
            grad = stage.backward(
                &trace.saved[i],
                &trace.saved[i + 1],
                dy,
                upstream[i],
                w,
                &mut out,
            )?;
        }
        if w.x {
            out.x = grad;
        }
        Ok(out)
    }
}

/// Channel-first views of the inputs.
struct Prepared<'t> {
    x: Cow<'t, Tensor>,
    weight: Cow<'t, Tensor>,
    residual: Option<Cow<'t, Tensor>>,
}

/// The fused convolution operator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusedConvolution {
    pub config: FusedConvConfig,
}

impl FusedConvolution {
    #[must_use]
    pub fn new(config: FusedConvConfig) -> Self {
        Self { config }
    }

    fn base_axis(&self) -> usize {
        self.config.conv.base_axis
    }

    fn norm_stage(&self) -> NormalizationStage {
        NormalizationStage::new(self.config.norm_params(self.base_axis()))
    }

    fn prepare<'t>(&self, inputs: &'t FusedInputs<'_>) -> Result<Prepared<'t>> {
        let layout = self.config.conv.layout;
        let base = self.base_axis();
        Ok(Prepared {
            x: to_channel_first(OP, inputs.x, layout, base)?,
            weight: to_channel_first(OP, inputs.weight, layout, 1)?,
            residual: inputs
                .residual
                .map(|z| to_channel_first(OP, z, layout, base))
                .transpose()?,
        })
    }

    fn pipeline<'t>(
        &self,
        inputs: &'t FusedInputs<'_>,
        prepared: &'t Prepared<'_>,
    ) -> Result<Pipeline<'t>> {
        let conv = &self.config.conv;
        let nd = prepared.weight.ndim().checked_sub(2).ok_or_else(|| {
            OpError::shape(
                OP,
                format!("weight must have rank >= 2, got {:?}", prepared.weight.shape),
            )
        })?;

        let mut stages = Vec::with_capacity(5);
        let padding = PaddingStage::new(conv.pad_pairs(nd)?, self.config.pad_mode);
        if !padding.is_noop() {
            stages.push(Stage::Padding(padding));
        }
        stages.push(Stage::Convolution {
            stage: ConvolutionStage::from_params(conv, nd)?,
            weight: &*prepared.weight,
            bias: inputs.bias,
        });
        if let Some(args) = inputs.norm_args() {
            stages.push(Stage::Normalization {
                stage: self.norm_stage(),
                args,
            });
        }
        if let Some(z) = &prepared.residual {
            stages.push(Stage::Residual { z: &**z });
        }
        stages.push(Stage::Activation(ActivationStage::new(self.config.activation)));
        Ok(Pipeline { stages })
    }

    /// Runs the block.
    ///
    /// In training mode the running statistics are updated once the output
    /// has been computed; a failing call leaves them untouched.
    ///
    /// # Errors
    /// [`OpError::NumericPolicyViolation`] for mixed precisions, otherwise
    /// the first stage error.
    pub fn forward(&self, inputs: &mut FusedInputs<'_>) -> Result<Tensor> {
        Precision::unify(OP, &inputs.tensors())?;
        let (y, stats) = {
            let prepared = self.prepare(inputs)?;
            let pipeline = self.pipeline(inputs, &prepared)?;
            debug!(
                "{OP} {:?} * {:?} [{}] ({})",
                inputs.x.shape,
                inputs.weight.shape,
                pipeline.describe(),
                inputs.x.precision
            );
            let mut trace = pipeline.run(&prepared.x)?;
            let y = trace.saved.pop().ok_or_else(|| OpError::invalid(OP, "empty pipeline"))?;
            (y, trace.stats)
        };
        if let (Some(stats), Some(norm)) = (stats, inputs.norm.as_mut()) {
            self.norm_stage()
                .update_running(&stats, norm.running_mean, norm.running_var);
        }
        Ok(from_channel_first(y, self.config.conv.layout, self.base_axis()))
    }

    /// Adds the gradients requested in `grads` given the output gradient `dy`.
    ///
    /// The forward pass is recomputed from `inputs`; running statistics are
    /// read, never updated.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] for slots inconsistent with `inputs` (or
    /// running-statistic requests in training mode), [`OpError::ShapeMismatch`]
    /// for buffers or `dy` of the wrong shape.
    pub fn backward(
        &self,
        inputs: &FusedInputs<'_>,
        dy: &Tensor,
        grads: &mut FusedGrads<'_>,
    ) -> Result<()> {
        let mut all = inputs.tensors();
        all.push(dy);
        Precision::unify(OP, &all)?;
        grads.validate(inputs, self.config.batch_stat)?;
        let w = grads.wants();

        let layout = self.config.conv.layout;
        let base = self.base_axis();
        let prepared = self.prepare(inputs)?;
        let pipeline = self.pipeline(inputs, &prepared)?;
        let dyc = to_channel_first(OP, dy, layout, base)?;
        let trace = pipeline.run(&prepared.x)?;
        let y = trace.saved.last().ok_or_else(|| OpError::invalid(OP, "empty pipeline"))?;
        if dyc.shape != y.shape {
            return Err(OpError::shapes(OP, "output gradient", &y.shape, &dyc.shape));
        }
        debug!("{OP} backward [{}] {:?}", pipeline.describe(), w);

        let g = pipeline.backward(&trace, dyc.into_owned(), w)?;

        let dx = g.x.map(|t| from_channel_first(t, layout, base));
        let dw = g.weight.map(|t| from_channel_first(t, layout, 1));
        let dz = g.residual.map(|t| from_channel_first(t, layout, base));
        for (slot, grad) in [
            (&mut grads.x, dx),
            (&mut grads.weight, dw),
            (&mut grads.bias, g.bias),
            (&mut grads.beta, g.beta),
            (&mut grads.gamma, g.gamma),
            (&mut grads.running_mean, g.mean),
            (&mut grads.running_var, g.var),
            (&mut grads.residual, dz),
        ] {
            if let Some(grad) = grad {
                slot.accumulate(&grad)?;
            }
        }
        Ok(())
    }
}

/// Runs the fused block described by `config`.
///
/// See [`FusedConvolution::forward`].
pub fn fused_convolution(inputs: &mut FusedInputs<'_>, config: &FusedConvConfig) -> Result<Tensor> {
    FusedConvolution::new(config.clone()).forward(inputs)
}

/// Backward of [`fused_convolution`].
///
/// See [`FusedConvolution::backward`].
pub fn fused_convolution_backward(
    inputs: &FusedInputs<'_>,
    config: &FusedConvConfig,
    dy: &Tensor,
    grads: &mut FusedGrads<'_>,
) -> Result<()> {
    FusedConvolution::new(config.clone()).backward(inputs, dy, grads)
}
