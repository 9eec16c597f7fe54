//! Residual addition stage.

use log::trace;

use crate::error::{OpError, Result};
use crate::ops::dispatch::{self, Path};
use crate::tensors::Tensor;

/// `y = h + z` for tensors of identical shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResidualStage;

impl ResidualStage {
    /// # Errors
    /// [`OpError::ShapeMismatch`] unless `h` and `z` have the same shape.
    pub fn forward(self, h: &Tensor, z: &Tensor) -> Result<Tensor> {
        if h.shape != z.shape {
            return Err(OpError::shapes("add2", "residual", &h.shape, &z.shape));
        }
        trace!("add2 {:?}", h.shape);
        let path = Path::of(h.precision);
        let data = dispatch::add(path, &h.data, &z.data);
        Ok(Tensor::new(h.shape.clone(), data).with_precision(path.precision()))
    }

    /// Both branches receive the output gradient unchanged.
    #[must_use]
    pub fn backward(self, dy: &Tensor) -> (Tensor, Tensor) {
        (dy.clone(), dy.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_matching_shapes() {
        let h = Tensor::new(vec![2], vec![1.0, 2.0]);
        let z = Tensor::new(vec![2], vec![0.5, 0.5]);
        assert_eq!(ResidualStage.forward(&h, &z).unwrap().data, vec![1.5, 2.5]);
    }

    #[test]
    fn mismatch_is_a_shape_error() {
        let h = Tensor::zeros(vec![2, 3]);
        let z = Tensor::zeros(vec![3, 2]);
        let err = ResidualStage.forward(&h, &z).unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch { op: "add2", .. }));
    }
}
