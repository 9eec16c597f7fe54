//! Elementwise nonlinearities and their derivatives.

use rayon::prelude::*;

use crate::params::Activation;

/// Applies `act` to a single value.
#[inline]
#[must_use]
pub fn apply(act: Activation, x: f32) -> f32 {
    match act {
        Activation::Identity => x,
        Activation::Relu => x.max(0.0),
        Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        Activation::Tanh => x.tanh(),
        Activation::LeakyRelu(alpha) => {
            if x > 0.0 {
                x
            } else {
                alpha * x
            }
        }
        Activation::Elu(alpha) => {
            if x > 0.0 {
                x
            } else {
                alpha * x.exp_m1()
            }
        }
        Activation::Relu6 => x.clamp(0.0, 6.0),
    }
}

/// Derivative of `act` at pre-activation `x` whose output was `y`.
///
/// At kinks the right-hand branch is not taken: `relu'(0) = 0`.
#[inline]
#[must_use]
pub fn derivative(act: Activation, x: f32, y: f32) -> f32 {
    match act {
        Activation::Identity => 1.0,
        Activation::Relu => f32::from(u8::from(x > 0.0)),
        Activation::Sigmoid => y * (1.0 - y),
        Activation::Tanh => 1.0 - y * y,
        Activation::LeakyRelu(alpha) => {
            if x > 0.0 {
                1.0
            } else {
                alpha
            }
        }
        Activation::Elu(alpha) => {
            if x > 0.0 {
                1.0
            } else {
                alpha * x.exp()
            }
        }
        Activation::Relu6 => f32::from(u8::from(x > 0.0 && x < 6.0)),
    }
}

/// Forward pass over a buffer.
#[must_use]
pub fn forward(act: Activation, x: &[f32]) -> Vec<f32> {
    if act == Activation::Identity {
        return x.to_vec();
    }
    x.par_iter().map(|&v| apply(act, v)).collect()
}

/// `dx = dy * act'(x)`, given the saved input `x` and output `y`.
#[must_use]
pub fn backward(act: Activation, x: &[f32], y: &[f32], dy: &[f32]) -> Vec<f32> {
    if act == Activation::Identity {
        return dy.to_vec();
    }
    x.par_iter()
        .zip(y)
        .zip(dy)
        .map(|((&x, &y), &g)| g * derivative(act, x, y))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piecewise_forward() {
        let x = [-2.0, 0.0, 3.0, 7.0];
        assert_eq!(forward(Activation::Relu, &x), vec![0.0, 0.0, 3.0, 7.0]);
        assert_eq!(forward(Activation::Relu6, &x), vec![0.0, 0.0, 3.0, 6.0]);
        assert_eq!(forward(Activation::LeakyRelu(0.5), &x), vec![-1.0, 0.0, 3.0, 7.0]);
        assert_eq!(forward(Activation::Identity, &x), x.to_vec());
    }

    #[test]
    fn smooth_forward() {
        assert!((apply(Activation::Sigmoid, 0.0) - 0.5).abs() < 1e-7);
        assert!((apply(Activation::Tanh, 1.0) - 1.0f32.tanh()).abs() < 1e-7);
        assert!((apply(Activation::Elu(1.0), -1.0) - ((-1.0f32).exp() - 1.0)).abs() < 1e-7);
    }

    #[test]
    fn derivatives_use_saved_values() {
        let x = [-1.0, 2.0];
        for act in [Activation::Sigmoid, Activation::Tanh, Activation::Elu(0.7)] {
            let y = forward(act, &x);
            let dx = backward(act, &x, &y, &[1.0, 1.0]);
            for (i, &xi) in x.iter().enumerate() {
                let h = 1e-3f32;
                let fd = (apply(act, xi + h) - apply(act, xi - h)) / (2.0 * h);
                assert!((dx[i] - fd).abs() < 1e-3, "{act:?} at {xi}: {} vs {fd}", dx[i]);
            }
        }
    }

    #[test]
    fn kink_takes_left_branch() {
        assert_eq!(derivative(Activation::Relu, 0.0, 0.0), 0.0);
        assert_eq!(derivative(Activation::Relu6, 6.0, 6.0), 0.0);
        assert_eq!(derivative(Activation::LeakyRelu(0.1), 0.0, 0.0), 0.1);
    }
}
