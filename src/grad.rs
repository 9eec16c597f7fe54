//! Per-input gradient requests.
//!
//! A [`GradRequest`] says three different things about one operator input:
//! the input does not exist in this configuration ([`GradRequest::Absent`]),
//! it exists but its gradient is not wanted ([`GradRequest::Skip`]), or its
//! gradient should be added into a caller-owned buffer
//! ([`GradRequest::Accumulate`]).

use crate::error::{OpError, Result};
use crate::tensors::Tensor;

/// Gradient slot for one operator input.
#[derive(Debug, Default)]
pub enum GradRequest<'a> {
    /// The input is not part of this configuration.
    #[default]
    Absent,
    /// The input exists; no gradient is computed for it.
    Skip,
    /// The gradient is summed into this buffer.
    Accumulate(&'a mut Tensor),
}

impl<'a> From<&'a mut Tensor> for GradRequest<'a> {
    fn from(buf: &'a mut Tensor) -> Self {
        Self::Accumulate(buf)
    }
}

impl GradRequest<'_> {
    /// Whether a gradient should be produced.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Accumulate(_))
    }

    /// Checks the slot against the input's presence and, when requested,
    /// the buffer's shape against the input's shape.
    pub(crate) fn validate(
        &self,
        op: &'static str,
        name: &str,
        input_shape: Option<&[usize]>,
    ) -> Result<()> {
        match (self, input_shape) {
            (Self::Absent, None) | (Self::Skip, Some(_)) => Ok(()),
            (Self::Absent, Some(_)) => Err(OpError::invalid(
                op,
                format!("'{name}' is present but its gradient slot is marked absent"),
            )),
            (_, None) => Err(OpError::invalid(
                op,
                format!("gradient slot given for absent input '{name}'"),
            )),
            (Self::Accumulate(buf), Some(shape)) => {
                if buf.shape.as_slice() == shape {
                    Ok(())
                } else {
                    Err(OpError::shapes(op, name, shape, &buf.shape))
                }
            }
        }
    }

    /// Adds `grad` into the buffer; no-op unless the slot is `Accumulate`.
    pub(crate) fn accumulate(&mut self, grad: &Tensor) -> Result<()> {
        match self {
            Self::Accumulate(buf) => buf.accumulate(grad),
            Self::Absent | Self::Skip => Ok(()),
        }
    }
}
