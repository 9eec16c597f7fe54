//! Activation stage.

use log::trace;

use crate::error::{OpError, Result};
use crate::ops::dispatch::{self, Path};
use crate::params::Activation;
use crate::tensors::Tensor;

/// Applies one [`Activation`] elementwise.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActivationStage {
    pub activation: Activation,
}

impl ActivationStage {
    #[must_use]
    pub fn new(activation: Activation) -> Self {
        Self { activation }
    }

    #[must_use]
    pub fn forward(&self, x: &Tensor) -> Tensor {
        trace!("{} {:?}", self.activation.tag(), x.shape);
        let path = Path::of(x.precision);
        let data = dispatch::activation(path, self.activation, &x.data);
        Tensor::new(x.shape.clone(), data).with_precision(path.precision())
    }

    /// `dx = dy * f'(x)`, where `y` is the output of [`forward`](Self::forward) on `x`.
    pub fn backward(&self, x: &Tensor, y: &Tensor, dy: &Tensor) -> Result<Tensor> {
        if dy.shape != x.shape {
            return Err(OpError::shapes("activation", "output gradient", &x.shape, &dy.shape));
        }
        let path = Path::of(dy.precision);
        let data = dispatch::activation_backward(path, self.activation, &x.data, &y.data, &dy.data);
        Ok(Tensor::new(x.shape.clone(), data).with_precision(path.precision()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relu_masks_gradient() {
        let stage = ActivationStage::new(Activation::Relu);
        let x = Tensor::new(vec![3], vec![-1.0, 0.5, 2.0]);
        let y = stage.forward(&x);
        let dx = stage.backward(&x, &y, &Tensor::full(vec![3], 2.0)).unwrap();
        assert_eq!(dx.data, vec![0.0, 2.0, 2.0]);
    }

    #[test]
    fn elu_derivative_is_output_plus_alpha() {
        let stage = ActivationStage::new(Activation::Elu(0.5));
        let x = Tensor::new(vec![1], vec![-0.7]);
        let y = stage.forward(&x);
        let dx = stage.backward(&x, &y, &Tensor::full(vec![1], 1.0)).unwrap();
        assert!((dx.data[0] - (y.data[0] + 0.5)).abs() < 1e-6);
    }
}
