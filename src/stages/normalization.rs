//! Batch normalization stage.
//!
//! Normalizes over every axis except `params.axis`. Parameters and running
//! statistics may have any shape with one element per channel (`[C]`,
//! `[1, C, 1, 1]`, ...); gradients come back in each parameter's own shape.
//!
//! In training mode the statistics come from the batch and backward
//! differentiates through them. In evaluation mode the running statistics are
//! used as they are and become ordinary inputs of the affine map.

use log::trace;

use crate::error::{OpError, Result};
use crate::ops::cpu::norm::{self, NormGeometry, NormNeeds};
use crate::ops::dispatch::{self, Path};
use crate::params::{BatchStat, NormParams};
use crate::tensors::Tensor;

use super::check_per_channel;

/// Batch normalization over one channel axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NormalizationStage {
    pub params: NormParams,
}

/// Statistics one forward pass normalized with.
#[derive(Debug, Clone, PartialEq)]
pub struct NormStats {
    pub mean: Vec<f32>,
    /// Biased variance.
    pub var: Vec<f32>,
    /// Elements per channel.
    pub count: usize,
}

/// Normalization gradients, each in the shape of its input.
#[derive(Debug, Default)]
pub struct NormStageGrads {
    pub dx: Option<Tensor>,
    pub dbeta: Option<Tensor>,
    pub dgamma: Option<Tensor>,
    pub dmean: Option<Tensor>,
    pub dvar: Option<Tensor>,
}

/// Per-channel tensors of one normalization call.
#[derive(Debug, Clone, Copy)]
pub struct NormArgs<'a> {
    pub beta: &'a Tensor,
    pub gamma: &'a Tensor,
    pub running_mean: &'a Tensor,
    pub running_var: &'a Tensor,
}

const OP: &str = "batch_normalization";

impl NormalizationStage {
    #[must_use]
    pub fn new(params: NormParams) -> Self {
        Self { params }
    }

    fn is_train(&self) -> bool {
        self.params.batch_stat == BatchStat::Train
    }

    /// Validates the call and resolves the `[outer, C, inner]` view of `x`.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] for an out-of-range axis, decay rate or
    /// eps; [`OpError::ShapeMismatch`] if a per-channel tensor has the wrong
    /// element count.
    pub fn geometry(&self, x: &[usize], args: NormArgs<'_>) -> Result<NormGeometry> {
        self.params.validate(OP)?;
        let axis = self.params.axis;
        if axis >= x.len() {
            return Err(OpError::invalid(
                OP,
                format!("axis {axis} out of range for rank {}", x.len()),
            ));
        }
        let c = x[axis];
        check_per_channel(OP, "beta", args.beta, c)?;
        check_per_channel(OP, "gamma", args.gamma, c)?;
        check_per_channel(OP, "running mean", args.running_mean, c)?;
        check_per_channel(OP, "running variance", args.running_var, c)?;
        Ok(NormGeometry::around(x, axis))
    }

    fn stats(&self, x: &Tensor, g: NormGeometry, args: NormArgs<'_>) -> NormStats {
        let (mean, var) = if self.is_train() {
            norm::batch_stats(&x.data, g)
        } else {
            (args.running_mean.data.clone(), args.running_var.data.clone())
        };
        NormStats {
            mean,
            var,
            count: g.count(),
        }
    }

    /// Normalizes `x`. Running statistics are read but never written here.
    pub fn forward(&self, x: &Tensor, args: NormArgs<'_>) -> Result<(Tensor, NormStats)> {
        let g = self.geometry(&x.shape, args)?;
        trace!(
            "batch_normalization {:?} axis {} ({:?})",
            x.shape, self.params.axis, self.params.batch_stat
        );
        let stats = self.stats(x, g, args);
        let path = Path::of(x.precision);
        let data = dispatch::normalize(
            path,
            &x.data,
            g,
            &stats.mean,
            &stats.var,
            &args.gamma.data,
            &args.beta.data,
            self.params.eps,
        );
        Ok((Tensor::new(x.shape.clone(), data).with_precision(path.precision()), stats))
    }

    /// Folds `stats` into the running statistics. No-op in evaluation mode.
    pub fn update_running(
        &self,
        stats: &NormStats,
        running_mean: &mut Tensor,
        running_var: &mut Tensor,
    ) {
        if !self.is_train() {
            return;
        }
        norm::update_running(
            &mut running_mean.data,
            &mut running_var.data,
            &stats.mean,
            &stats.var,
            stats.count,
            self.params.decay_rate,
        );
        running_mean.precision.round_slice(&mut running_mean.data);
        running_var.precision.round_slice(&mut running_var.data);
    }

    /// Gradients selected by `needs`.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] if running-statistic gradients are asked
    /// for in training mode, where they are not inputs of the output.
    pub fn backward(
        &self,
        x: &Tensor,
        args: NormArgs<'_>,
        dy: &Tensor,
        needs: NormNeeds,
    ) -> Result<NormStageGrads> {
        let g = self.geometry(&x.shape, args)?;
        if dy.shape != x.shape {
            return Err(OpError::shapes(OP, "output gradient", &x.shape, &dy.shape));
        }
        let train = self.is_train();
        if train && (needs.mean || needs.var) {
            return Err(OpError::invalid(
                OP,
                "running statistics have no gradient when batch statistics are used",
            ));
        }
        trace!("batch_normalization backward {:?} ({needs:?})", dy.shape);

        let stats = self.stats(x, g, args);
        let path = Path::of(dy.precision);
        let grads = dispatch::norm_backward(
            path,
            train,
            &x.data,
            &dy.data,
            g,
            &stats.mean,
            &stats.var,
            &args.gamma.data,
            self.params.eps,
            needs,
        );
        let p = path.precision();
        let shaped = |d: Option<Vec<f32>>, like: &Tensor| {
            d.map(|d| Tensor::new(like.shape.clone(), d).with_precision(p))
        };
        Ok(NormStageGrads {
            dx: shaped(grads.dx, x),
            dbeta: shaped(grads.dbeta, args.beta),
            dgamma: shaped(grads.dgamma, args.gamma),
            dmean: shaped(grads.dmean, args.running_mean),
            dvar: shaped(grads.dvar, args.running_var),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(c: usize) -> (Tensor, Tensor, Tensor, Tensor) {
        (
            Tensor::zeros(vec![c]),
            Tensor::full(vec![c], 1.0),
            Tensor::zeros(vec![c]),
            Tensor::full(vec![c], 1.0),
        )
    }

    fn args<'a>(p: &'a (Tensor, Tensor, Tensor, Tensor)) -> NormArgs<'a> {
        NormArgs {
            beta: &p.0,
            gamma: &p.1,
            running_mean: &p.2,
            running_var: &p.3,
        }
    }

    #[test]
    fn eval_uses_running_statistics() {
        let stage = NormalizationStage::new(NormParams {
            batch_stat: BatchStat::Eval,
            eps: 0.0,
            ..NormParams::default()
        });
        let p = params(1);
        let x = Tensor::new(vec![2, 1], vec![3.0, -1.0]);
        let (y, stats) = stage.forward(&x, args(&p)).unwrap();
        // running mean 0, var 1: identity
        assert_eq!(y.data, vec![3.0, -1.0]);
        assert_eq!(stats.mean, vec![0.0]);
    }

    #[test]
    fn train_update_is_explicit() {
        let stage = NormalizationStage::default();
        let p = params(1);
        let x = Tensor::new(vec![2, 1], vec![1.0, 3.0]);
        let (_, stats) = stage.forward(&x, args(&p)).unwrap();
        assert_eq!((stats.mean.clone(), stats.var.clone(), stats.count), (vec![2.0], vec![1.0], 2));

        let (mut rm, mut rv) = (p.2.clone(), p.3.clone());
        stage.update_running(&stats, &mut rm, &mut rv);
        assert!((rm.data[0] - 0.2).abs() < 1e-6);
        // unbiased variance 2
        assert!((rv.data[0] - (0.9 + 0.1 * 2.0)).abs() < 1e-6);
    }

    #[test]
    fn parameter_shapes_are_checked() {
        let stage = NormalizationStage::default();
        let p = params(3);
        let x = Tensor::zeros(vec![2, 2, 4]);
        assert!(matches!(stage.forward(&x, args(&p)), Err(OpError::ShapeMismatch { .. })));

        let bad = NormalizationStage::new(NormParams {
            decay_rate: 1.5,
            ..NormParams::default()
        });
        let x = Tensor::zeros(vec![2, 3]);
        assert!(matches!(bad.forward(&x, args(&p)), Err(OpError::InvalidArgument { .. })));
    }

    #[test]
    fn running_gradients_only_in_eval() {
        let p = params(1);
        let x = Tensor::new(vec![2, 1], vec![1.0, 2.0]);
        let dy = Tensor::full(vec![2, 1], 1.0);
        let needs = NormNeeds {
            mean: true,
            ..NormNeeds::default()
        };
        assert!(NormalizationStage::default().backward(&x, args(&p), &dy, needs).is_err());

        let eval = NormalizationStage::new(NormParams {
            batch_stat: BatchStat::Eval,
            ..NormParams::default()
        });
        let grads = eval.backward(&x, args(&p), &dy, needs).unwrap();
        assert_eq!(grads.dmean.map(|t| t.shape), Some(vec![1]));
        assert!(grads.dx.is_none());
    }
}
