//! Storage precision of tensor values.
//!
//! Every tensor stores `f32`, but its values may be constrained to a
//! reduced-precision grid. The reduced instruction path computes in `f32` and
//! rounds each stage output and each gradient onto the grid, which is the
//! numerical contract a native half-precision kernel has to meet.

use core::fmt;

use half::{bf16, f16};

use crate::error::{OpError, Result};
use crate::tensors::Tensor;

/// Precision of a tensor's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    /// IEEE single precision.
    #[default]
    F32,
    /// IEEE half precision (`half::f16`).
    F16,
    /// Brain floating point (`half::bf16`).
    BF16,
}

impl Precision {
    /// Rounds a single value onto this precision's grid.
    #[inline]
    #[must_use]
    pub fn round(self, v: f32) -> f32 {
        match self {
            Self::F32 => v,
            Self::F16 => f16::from_f32(v).to_f32(),
            Self::BF16 => bf16::from_f32(v).to_f32(),
        }
    }

    /// Rounds a buffer in place. No-op for [`Precision::F32`].
    pub fn round_slice(self, data: &mut [f32]) {
        if self == Self::F32 {
            return;
        }
        for v in data {
            *v = self.round(*v);
        }
    }

    /// Whether this is a reduced-precision grid.
    #[must_use]
    pub fn is_reduced(self) -> bool {
        self != Self::F32
    }

    /// Returns the common precision of `tensors`.
    ///
    /// # Errors
    /// [`OpError::NumericPolicyViolation`] if two tensors disagree.
    pub(crate) fn unify(op: &'static str, tensors: &[&Tensor]) -> Result<Self> {
        let Some(first) = tensors.first() else {
            return Ok(Self::F32);
        };
        let p = first.precision;
        if let Some(other) = tensors.iter().find(|t| t.precision != p) {
            return Err(OpError::precision(
                op,
                format!("cannot mix {p} and {} inputs", other.precision),
            ));
        }
        Ok(p)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
        })
    }
}
