//! Spatial padding stage.

use log::trace;

use crate::error::{OpError, Result};
use crate::ops::dispatch::{self, Path};
use crate::params::PadMode;
use crate::tensors::Tensor;

/// Pads the trailing `widths.len()` axes of its input.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddingStage {
    /// `(before, after)` per padded axis, outermost first.
    pub widths: Vec<(usize, usize)>,
    pub mode: PadMode,
}

impl PaddingStage {
    #[must_use]
    pub fn new(widths: Vec<(usize, usize)>, mode: PadMode) -> Self {
        Self { widths, mode }
    }

    /// Whether the stage leaves every tensor unchanged.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.widths.iter().all(|&(b, a)| b == 0 && a == 0)
    }

    /// Checks that the stage can pad a tensor of shape `shape`.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] if there are more padded axes than axes,
    /// if reflect/repeat padding is asked to extend an empty axis, or if the
    /// padded tensor would not be addressable.
    pub fn validate(&self, shape: &[usize]) -> Result<()> {
        self.output_shape(shape).map(drop)
    }

    /// Shape of the padded output.
    ///
    /// # Errors
    /// Same as [`validate`](Self::validate).
    pub fn output_shape(&self, shape: &[usize]) -> Result<Vec<usize>> {
        if self.widths.len() > shape.len() {
            return Err(OpError::invalid(
                "pad",
                format!("{} padded axes for a rank {} tensor", self.widths.len(), shape.len()),
            ));
        }
        let lead = shape.len() - self.widths.len();
        let mut out = shape.to_vec();
        for (d, &(b, a)) in self.widths.iter().enumerate() {
            let n = shape[lead + d];
            if n == 0 && (b > 0 || a > 0) && !matches!(self.mode, PadMode::Constant(_)) {
                return Err(OpError::invalid(
                    "pad",
                    format!("cannot {:?}-pad empty axis {}", self.mode, lead + d),
                ));
            }
            out[lead + d] = n
                .checked_add(b)
                .and_then(|v| v.checked_add(a))
                .filter(|&v| isize::try_from(v).is_ok())
                .ok_or_else(|| too_large(shape, &self.widths))?;
        }
        if !out.contains(&0) {
            out.iter()
                .try_fold(1usize, |acc, &v| acc.checked_mul(v))
                .filter(|&v| isize::try_from(v).is_ok())
                .ok_or_else(|| too_large(shape, &self.widths))?;
        }
        Ok(out)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let path = Path::of(x.precision);
        let out_shape = self.output_shape(&x.shape)?;
        trace!("pad {:?} -> {:?} ({:?})", x.shape, out_shape, self.mode);
        let data = dispatch::pad(path, &x.data, &x.shape, &self.widths, self.mode);
        Ok(Tensor::new(out_shape, data).with_precision(path.precision()))
    }

    /// Gradient with respect to an input of shape `in_shape`.
    pub fn backward(&self, in_shape: &[usize], dy: &Tensor) -> Result<Tensor> {
        let expected = self.output_shape(in_shape)?;
        if dy.shape != expected {
            return Err(OpError::shapes("pad", "output gradient", &expected, &dy.shape));
        }
        let path = Path::of(dy.precision);
        let data = dispatch::pad_backward(path, &dy.data, in_shape, &self.widths, self.mode);
        Ok(Tensor::new(in_shape.to_vec(), data).with_precision(path.precision()))
    }
}

fn too_large(shape: &[usize], widths: &[(usize, usize)]) -> OpError {
    OpError::invalid("pad", format!("padding {shape:?} by {widths:?} overflows the index space"))
}
