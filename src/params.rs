//! Operator configuration.
//!
//! Plain structs with `Default`s and `with_*` builders, plus tag parsing for
//! callers that describe operators with strings (`"relu"`, `"reflect"`, ...).

use crate::error::{OpError, Result};

/// Which axis holds channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// `[*outer, C, *spatial]`
    #[default]
    ChannelFirst,
    /// `[*outer, *spatial, C]`
    ChannelLast,
}

/// How padded positions are filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PadMode {
    /// Fill with a scalar.
    Constant(f32),
    /// Mirror interior samples without repeating the edge one.
    Reflect,
    /// Replicate the edge sample.
    Repeat,
}

impl Default for PadMode {
    fn default() -> Self {
        Self::Constant(0.0)
    }
}

impl PadMode {
    /// Parses `"constant"`, `"reflect"` or `"repeat"`.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] for any other tag.
    pub fn from_tag(tag: &str, constant_value: f32) -> Result<Self> {
        match tag {
            "constant" => Ok(Self::Constant(constant_value)),
            "reflect" => Ok(Self::Reflect),
            "repeat" => Ok(Self::Repeat),
            other => Err(OpError::invalid("pad", format!("unknown pad mode '{other}'"))),
        }
    }
}

/// Elementwise nonlinearity applied at the end of the fused block.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    /// Slope for negative inputs.
    LeakyRelu(f32),
    /// Scale of the negative branch.
    Elu(f32),
    Relu6,
}

impl Activation {
    /// Builds an activation from its tag and scalar arguments.
    ///
    /// An empty tag means identity. `leaky_relu` defaults to `0.1` and `elu`
    /// to `1.0` when no argument is given.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] for unknown tags or a wrong argument count.
    pub fn from_tag(tag: &str, args: &[f32]) -> Result<Self> {
        let scalar = |default: f32| match args {
            [] => Ok(default),
            [a] => Ok(*a),
            _ => Err(OpError::invalid(
                "activation",
                format!("'{tag}' takes one argument, got {}", args.len()),
            )),
        };
        let act = match tag {
            "" | "identity" => Self::Identity,
            "relu" => Self::Relu,
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "relu6" => Self::Relu6,
            "leaky_relu" => return Ok(Self::LeakyRelu(scalar(0.1)?)),
            "elu" => return Ok(Self::Elu(scalar(1.0)?)),
            other => {
                return Err(OpError::invalid(
                    "activation",
                    format!("unknown nonlinearity '{other}'"),
                ));
            }
        };
        if !args.is_empty() {
            return Err(OpError::invalid(
                "activation",
                format!("'{tag}' takes no arguments, got {}", args.len()),
            ));
        }
        Ok(act)
    }

    /// Canonical tag.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Relu => "relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::LeakyRelu(_) => "leaky_relu",
            Self::Elu(_) => "elu",
            Self::Relu6 => "relu6",
        }
    }

    /// Inputs where the derivative jumps.
    #[must_use]
    pub fn kinks(self) -> &'static [f32] {
        match self {
            Self::Relu | Self::LeakyRelu(_) | Self::Elu(_) => &[0.0],
            Self::Relu6 => &[0.0, 6.0],
            Self::Identity | Self::Sigmoid | Self::Tanh => &[],
        }
    }
}

/// Whether normalization uses batch or running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchStat {
    /// Batch statistics; running statistics are updated.
    #[default]
    Train,
    /// Stored running statistics; nothing is updated.
    Eval,
}

impl From<bool> for BatchStat {
    fn from(batch_stat: bool) -> Self {
        if batch_stat { Self::Train } else { Self::Eval }
    }
}

/// Convolution parameters.
///
/// `pad_width` holds either one entry per spatial dimension (symmetric) or
/// `before, after` pairs for every spatial dimension. Empty `stride` and
/// `dilation` mean ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub base_axis: usize,
    pub pad_width: Vec<usize>,
    pub stride: Vec<usize>,
    pub dilation: Vec<usize>,
    pub group: usize,
    pub layout: Layout,
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            base_axis: 1,
            pad_width: Vec::new(),
            stride: Vec::new(),
            dilation: Vec::new(),
            group: 1,
            layout: Layout::ChannelFirst,
        }
    }
}

impl ConvParams {
    #[must_use]
    pub fn with_base_axis(mut self, base_axis: usize) -> Self {
        self.base_axis = base_axis;
        self
    }

    #[must_use]
    pub fn with_pad(mut self, pad_width: impl Into<Vec<usize>>) -> Self {
        self.pad_width = pad_width.into();
        self
    }

    #[must_use]
    pub fn with_stride(mut self, stride: impl Into<Vec<usize>>) -> Self {
        self.stride = stride.into();
        self
    }

    #[must_use]
    pub fn with_dilation(mut self, dilation: impl Into<Vec<usize>>) -> Self {
        self.dilation = dilation.into();
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Expands `pad_width` into `(before, after)` per spatial dimension.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] unless the length is `spatial_dims` or
    /// `2 * spatial_dims` (an empty list means no padding).
    pub fn pad_pairs(&self, spatial_dims: usize) -> Result<Vec<(usize, usize)>> {
        let pw = &self.pad_width;
        if pw.is_empty() {
            Ok(vec![(0, 0); spatial_dims])
        } else if pw.len() == spatial_dims {
            Ok(pw.iter().map(|&p| (p, p)).collect())
        } else if pw.len() == 2 * spatial_dims {
            Ok(pw.chunks_exact(2).map(|c| (c[0], c[1])).collect())
        } else {
            Err(OpError::invalid(
                "convolution",
                format!(
                    "pad width length {} must be {spatial_dims} or {}",
                    pw.len(),
                    2 * spatial_dims
                ),
            ))
        }
    }

    pub(crate) fn strides_for(&self, spatial_dims: usize) -> Result<Vec<usize>> {
        per_dim("stride", &self.stride, spatial_dims)
    }

    pub(crate) fn dilations_for(&self, spatial_dims: usize) -> Result<Vec<usize>> {
        per_dim("dilation", &self.dilation, spatial_dims)
    }
}

fn per_dim(what: &str, values: &[usize], spatial_dims: usize) -> Result<Vec<usize>> {
    if values.is_empty() {
        return Ok(vec![1; spatial_dims]);
    }
    if values.len() != spatial_dims {
        return Err(OpError::invalid(
            "convolution",
            format!("{what} has {} entries for {spatial_dims} spatial dims", values.len()),
        ));
    }
    if values.contains(&0) {
        return Err(OpError::invalid("convolution", format!("{what} must be >= 1")));
    }
    Ok(values.to_vec())
}

/// Batch-normalization parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormParams {
    pub axis: usize,
    pub decay_rate: f32,
    pub eps: f32,
    pub batch_stat: BatchStat,
}

impl Default for NormParams {
    fn default() -> Self {
        Self {
            axis: 1,
            decay_rate: 0.9,
            eps: 1e-5,
            batch_stat: BatchStat::Train,
        }
    }
}

impl NormParams {
    pub(crate) fn validate(&self, op: &'static str) -> Result<()> {
        if !(0.0..=1.0).contains(&self.decay_rate) {
            return Err(OpError::invalid(
                op,
                format!("decay rate {} outside [0, 1]", self.decay_rate),
            ));
        }
        if self.eps.is_nan() || self.eps < 0.0 {
            return Err(OpError::invalid(op, format!("eps {} must be >= 0", self.eps)));
        }
        Ok(())
    }
}

/// Full configuration of the fused convolution block.
///
/// The normalization axis is not configurable here: it is the channel axis
/// selected by `conv.layout`.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedConvConfig {
    pub conv: ConvParams,
    pub decay_rate: f32,
    pub eps: f32,
    pub batch_stat: BatchStat,
    pub activation: Activation,
    pub pad_mode: PadMode,
}

impl Default for FusedConvConfig {
    fn default() -> Self {
        let norm = NormParams::default();
        Self {
            conv: ConvParams::default(),
            decay_rate: norm.decay_rate,
            eps: norm.eps,
            batch_stat: norm.batch_stat,
            activation: Activation::Identity,
            pad_mode: PadMode::default(),
        }
    }
}

impl FusedConvConfig {
    /// Builds a configuration from string tags.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] for unknown activation or pad tags.
    #[allow(clippy::too_many_arguments)]
    pub fn from_tags(
        conv: ConvParams,
        decay_rate: f32,
        eps: f32,
        batch_stat: bool,
        activation_tag: &str,
        activation_args: &[f32],
        pad_mode: &str,
        pad_constant: f32,
    ) -> Result<Self> {
        Ok(Self {
            conv,
            decay_rate,
            eps,
            batch_stat: batch_stat.into(),
            activation: Activation::from_tag(activation_tag, activation_args)?,
            pad_mode: PadMode::from_tag(pad_mode, pad_constant)?,
        })
    }

    #[must_use]
    pub fn with_conv(mut self, conv: ConvParams) -> Self {
        self.conv = conv;
        self
    }

    #[must_use]
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    #[must_use]
    pub fn with_pad_mode(mut self, pad_mode: PadMode) -> Self {
        self.pad_mode = pad_mode;
        self
    }

    #[must_use]
    pub fn with_batch_stat(mut self, batch_stat: BatchStat) -> Self {
        self.batch_stat = batch_stat;
        self
    }

    #[must_use]
    pub fn with_norm(mut self, decay_rate: f32, eps: f32) -> Self {
        self.decay_rate = decay_rate;
        self.eps = eps;
        self
    }

    /// Normalization parameters over channel axis `axis`.
    #[must_use]
    pub fn norm_params(&self, axis: usize) -> NormParams {
        NormParams {
            axis,
            decay_rate: self.decay_rate,
            eps: self.eps,
            batch_stat: self.batch_stat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_tags() {
        assert_eq!(Activation::from_tag("", &[]), Ok(Activation::Identity));
        assert_eq!(Activation::from_tag("leaky_relu", &[0.2]), Ok(Activation::LeakyRelu(0.2)));
        assert_eq!(Activation::from_tag("leaky_relu", &[]), Ok(Activation::LeakyRelu(0.1)));
        assert_eq!(Activation::from_tag("elu", &[]), Ok(Activation::Elu(1.0)));
        assert!(Activation::from_tag("elu", &[0.1, 0.2]).is_err());
        assert!(Activation::from_tag("relu", &[1.0]).is_err());
        assert!(matches!(
            Activation::from_tag("swish", &[]),
            Err(OpError::InvalidArgument { .. })
        ));
        assert_eq!(Activation::Relu6.tag(), "relu6");
    }

    #[test]
    fn pad_width_expansion() {
        let p = ConvParams::default().with_pad(vec![1, 1]);
        assert_eq!(p.pad_pairs(2), Ok(vec![(1, 1), (1, 1)]));

        let p = ConvParams::default().with_pad(vec![2, 1, 2, 1]);
        assert_eq!(p.pad_pairs(2), Ok(vec![(2, 1), (2, 1)]));

        let p = ConvParams::default().with_pad(vec![1, 2, 3]);
        assert!(matches!(p.pad_pairs(2), Err(OpError::InvalidArgument { .. })));
    }

    #[test]
    fn strides_default_to_one() {
        let p = ConvParams::default();
        assert_eq!(p.strides_for(3), Ok(vec![1, 1, 1]));
        assert!(p.clone().with_stride(vec![2]).strides_for(2).is_err());
        assert!(p.with_dilation(vec![0, 1]).dilations_for(2).is_err());
    }

    #[test]
    fn pad_mode_tags() {
        assert_eq!(PadMode::from_tag("constant", 1.0), Ok(PadMode::Constant(1.0)));
        assert_eq!(PadMode::from_tag("reflect", 0.0), Ok(PadMode::Reflect));
        assert!(PadMode::from_tag("wrap", 0.0).is_err());
        assert_eq!(BatchStat::from(false), BatchStat::Eval);
    }
}
