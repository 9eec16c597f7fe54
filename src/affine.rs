//! Binary-connect affine operator.
//!
//! `y = reshape(x, [*outer, k]) · sign(w) + b`, where `w` is viewed as
//! `[k, n]` and `sign` maps exact zeros to a caller-chosen value. The output
//! has shape `outer ++ w.shape[1..]`.
//!
//! Backward uses the binarized weight for the input gradient and ignores the
//! binarization entirely for the weight gradient:
//!
//! - `dx = dy · sign(w)ᵀ`
//! - `dw = xᵀ · dy`
//! - `db = Σ_rows dy`

use log::debug;

use crate::error::{OpError, Result};
use crate::grad::GradRequest;
use crate::ops::dispatch::{self, Path};
use crate::precision::Precision;
use crate::tensors::Tensor;

const OP: &str = "binary_connect_affine";

/// Gradient slots of the affine backward.
#[derive(Debug, Default)]
pub struct AffineGrads<'a> {
    pub x: GradRequest<'a>,
    pub weight: GradRequest<'a>,
    pub bias: GradRequest<'a>,
}

impl AffineGrads<'_> {
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

/// Matrix view of one affine call.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AffineShape {
    rows: usize,
    inner: usize,
    cols: usize,
    out: Vec<usize>,
}

/// Affine transform with a sign-binarized weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryConnectAffine {
    /// First axis of `x` folded into the reduction; negative counts from the end.
    pub base_axis: isize,
    /// Value exact zeros of the weight binarize to.
    pub quantize_zero_to: f32,
}

impl Default for BinaryConnectAffine {
    fn default() -> Self {
        Self {
            base_axis: 1,
            quantize_zero_to: 1.0,
        }
    }
}

impl BinaryConnectAffine {
    #[must_use]
    pub fn new(base_axis: isize, quantize_zero_to: f32) -> Self {
        Self {
            base_axis,
            quantize_zero_to,
        }
    }

    fn resolve_axis(&self, ndim: usize) -> Result<usize> {
        let rank = ndim as isize;
        let axis = if self.base_axis < 0 {
            self.base_axis + rank
        } else {
            self.base_axis
        };
        if (0..rank).contains(&axis) {
            Ok(axis as usize)
        } else {
            Err(OpError::invalid(
                OP,
                format!("base axis {} out of range for rank {ndim}", self.base_axis),
            ))
        }
    }

    fn shape(&self, x: &Tensor, w: &Tensor, bias: Option<&Tensor>) -> Result<AffineShape> {
        let axis = self.resolve_axis(x.ndim())?;
        let Some((&k, out_tail)) = w.shape.split_first() else {
            return Err(OpError::shape(OP, "weight must have rank >= 1"));
        };
        let inner: usize = x.shape[axis..].iter().product();
        if inner != k {
            return Err(OpError::shape(
                OP,
                format!(
                    "input {:?} from axis {axis} has {inner} features, weight {:?} expects {k}",
                    x.shape, w.shape
                ),
            ));
        }
        let cols: usize = out_tail.iter().product();
        if let Some(b) = bias {
            if b.numel() != cols {
                return Err(OpError::shape(
                    OP,
                    format!("bias {:?} for {cols} outputs", b.shape),
                ));
            }
        }
        let mut out = x.shape[..axis].to_vec();
        out.extend_from_slice(out_tail);
        Ok(AffineShape {
            rows: x.shape[..axis].iter().product(),
            inner,
            cols,
            out,
        })
    }

    /// Runs the affine map and writes `sign(w)` into `weight_binarized`.
    ///
    /// # Errors
    /// [`OpError::InvalidArgument`] for an out-of-range base axis,
    /// [`OpError::ShapeMismatch`] if `x`, `w`, the bias or the binarized
    /// buffer disagree, [`OpError::NumericPolicyViolation`] for mixed precisions.
    pub fn forward(
        &self,
        x: &Tensor,
        weight: &Tensor,
        weight_binarized: &mut Tensor,
        bias: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut all = vec![x, weight, &*weight_binarized];
        all.extend(bias);
        let path = Path::of(Precision::unify(OP, &all)?);
        let s = self.shape(x, weight, bias)?;
        if weight_binarized.shape != weight.shape {
            return Err(OpError::shapes(
                OP,
                "binarized weight buffer",
                &weight.shape,
                &weight_binarized.shape,
            ));
        }
        debug!(
            "{OP} {:?} x {:?} -> {:?} (base axis {}, zero -> {})",
            x.shape, weight.shape, s.out, self.base_axis, self.quantize_zero_to
        );

        dispatch::binarize_into(
            path,
            &weight.data,
            self.quantize_zero_to,
            &mut weight_binarized.data,
        );
        let y = dispatch::affine(
            path,
            &x.data,
            &weight_binarized.data,
            bias.map(|b| b.data.as_slice()),
            s.rows,
            s.inner,
            s.cols,
        );
        Ok(Tensor::new(s.out, y).with_precision(path.precision()))
    }

    /// Adds the requested gradients into `grads`.
    ///
    /// The binarized weight is recomputed from `weight`.
    pub fn backward(
        &self,
        x: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        dy: &Tensor,
        grads: &mut AffineGrads<'_>,
    ) -> Result<()> {
        let mut all = vec![x, weight, dy];
        all.extend(bias);
        let path = Path::of(Precision::unify(OP, &all)?);
        let s = self.shape(x, weight, bias)?;
        if dy.shape != s.out {
            return Err(OpError::shapes(OP, "output gradient", &s.out, &dy.shape));
        }
        grads.x.validate(OP, "x", Some(&x.shape))?;
        grads.weight.validate(OP, "weight", Some(&weight.shape))?;
        grads.bias.validate(OP, "bias", bias.map(|b| b.shape.as_slice()))?;
        debug!(
            "{OP} backward {:?} (x: {}, weight: {}, bias: {})",
            dy.shape,
            grads.x.is_requested(),
            grads.weight.is_requested(),
            grads.bias.is_requested()
        );

        let p = path.precision();
        let dx = grads.x.is_requested().then(|| {
            let wb = dispatch::binarize(path, &weight.data, self.quantize_zero_to);
            let d = dispatch::matmul_nt(path, &dy.data, &wb, s.rows, s.cols, s.inner);
            Tensor::new(x.shape.clone(), d).with_precision(p)
        });
        let dw = grads.weight.is_requested().then(|| {
            let d = dispatch::matmul_tn(path, &x.data, &dy.data, s.rows, s.inner, s.cols);
            Tensor::new(weight.shape.clone(), d).with_precision(p)
        });
        let db = bias.filter(|_| grads.bias.is_requested()).map(|b| {
            let d = dispatch::sum_rows(path, &dy.data, s.rows, s.cols);
            Tensor::new(b.shape.clone(), d).with_precision(p)
        });

        if let Some(dx) = dx {
            grads.x.accumulate(&dx)?;
        }
        if let Some(dw) = dw {
            grads.weight.accumulate(&dw)?;
        }
        if let Some(db) = db {
            grads.bias.accumulate(&db)?;
        }
        Ok(())
    }
}

/// Binary-connect affine forward.
///
/// # Example
/// ```rust
/// use briny_kernels::affine::binary_connect_affine;
/// use briny_kernels::tensors::Tensor;
///
/// let x = Tensor::full(vec![2, 3, 4], 1.0);
/// let w = Tensor::new(vec![4, 4], (0..16).map(|v| v as f32 - 8.0).collect());
/// let mut wb = Tensor::zeros(vec![4, 4]);
/// let b = Tensor::zeros(vec![4]);
/// let y = binary_connect_affine(&x, &w, &mut wb, Some(&b), 2, -1.0).unwrap();
/// assert_eq!(y.shape, vec![2, 3, 4]);
/// assert!(wb.data.iter().all(|v| *v == 1.0 || *v == -1.0));
/// ```
pub fn binary_connect_affine(
    x: &Tensor,
    weight: &Tensor,
    weight_binarized: &mut Tensor,
    bias: Option<&Tensor>,
    base_axis: isize,
    quantize_zero_to: f32,
) -> Result<Tensor> {
    BinaryConnectAffine::new(base_axis, quantize_zero_to).forward(x, weight, weight_binarized, bias)
}

/// Binary-connect affine backward.
pub fn binary_connect_affine_backward(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    dy: &Tensor,
    base_axis: isize,
    quantize_zero_to: f32,
    grads: &mut AffineGrads<'_>,
) -> Result<()> {
    BinaryConnectAffine::new(base_axis, quantize_zero_to).backward(x, weight, bias, dy, grads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_base_axis_counts_from_the_end() {
        let op = BinaryConnectAffine::new(-1, 1.0);
        assert_eq!(op.resolve_axis(3), Ok(2));
        assert!(BinaryConnectAffine::new(-4, 1.0).resolve_axis(3).is_err());
        assert!(BinaryConnectAffine::new(3, 1.0).resolve_axis(3).is_err());
    }

    #[test]
    fn forward_uses_binarized_weight() {
        // x: [1, 2], w: [2, 1] = [0.25, 0] -> sign = [1, q]
        let x = Tensor::new(vec![1, 2], vec![2.0, 3.0]);
        let w = Tensor::new(vec![2, 1], vec![0.25, 0.0]);
        let mut wb = Tensor::zeros(vec![2, 1]);
        let y = BinaryConnectAffine::new(1, -1.0).forward(&x, &w, &mut wb, None).unwrap();
        assert_eq!(wb.data, vec![1.0, -1.0]);
        assert_eq!(y.data, vec![-1.0]);
    }

    #[test]
    fn gradients_keep_the_asymmetry() {
        let x = Tensor::new(vec![1, 2], vec![2.0, 3.0]);
        let w = Tensor::new(vec![2, 1], vec![0.25, -4.0]);
        let dy = Tensor::new(vec![1, 1], vec![0.5]);
        let (mut dx, mut dw) = (Tensor::zeros(vec![1, 2]), Tensor::zeros(vec![2, 1]));
        let mut grads = AffineGrads {
            x: (&mut dx).into(),
            weight: (&mut dw).into(),
            bias: GradRequest::Absent,
        };
        BinaryConnectAffine::new(1, 0.0).backward(&x, &w, None, &dy, &mut grads).unwrap();
        // straight through sign(w) for x
        assert_eq!(dx.data, vec![0.5, -0.5]);
        // no correction for w
        assert_eq!(dw.data, vec![1.0, 1.5]);
    }

    #[test]
    fn placeholder_must_match_weight() {
        let x = Tensor::zeros(vec![1, 2]);
        let w = Tensor::zeros(vec![2, 1]);
        let mut wb = Tensor::zeros(vec![1, 2]);
        let err = BinaryConnectAffine::default().forward(&x, &w, &mut wb, None).unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch { .. }));
        assert_eq!(wb.data, vec![0.0, 0.0]);
    }
}
