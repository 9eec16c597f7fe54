#![allow(dead_code)]

use briny_kernels::finite_diff::finite_diff_grad;
use briny_kernels::tensors::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const FD_EPS: f32 = 1e-3;
pub const FD_ATOL: f64 = 1e-2;
pub const FD_RTOL: f64 = 1e-2;

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn uniform(rng: &mut StdRng, shape: &[usize], lo: f32, hi: f32) -> Tensor {
    let n = shape.iter().product();
    Tensor::new(shape.to_vec(), (0..n).map(|_| rng.random_range(lo..hi)).collect())
}

pub fn with_data(like: &Tensor, data: &[f32]) -> Tensor {
    Tensor::new(like.shape.clone(), data.to_vec()).with_precision(like.precision)
}

/// Compares `analytic` with central differences of `loss` at `point`.
///
/// `region` names the linear piece an evaluation lands in (e.g. the sign
/// pattern of pre-activations); coordinates whose two probes land in
/// different pieces are skipped. Returns how many coordinates were checked.
pub fn check_grad<F, R>(name: &str, point: &[f32], analytic: &[f32], loss: F, region: R) -> usize
where
    F: Fn(&[f32]) -> f64,
    R: Fn(&[f32]) -> Vec<bool>,
{
    assert_eq!(point.len(), analytic.len(), "{name}: gradient length");
    let numeric = finite_diff_grad(&loss, point, FD_EPS);
    let mut probe = point.to_vec();
    let mut checked = 0;
    for (i, (&a, &n)) in analytic.iter().zip(&numeric).enumerate() {
        probe[i] = point[i] + FD_EPS;
        let plus = region(&probe);
        probe[i] = point[i] - FD_EPS;
        let minus = region(&probe);
        probe[i] = point[i];
        if plus != minus {
            continue;
        }
        let a = f64::from(a);
        assert!(
            (a - n).abs() <= FD_ATOL + FD_RTOL * n.abs(),
            "{name}[{i}]: analytic {a} vs numeric {n}"
        );
        checked += 1;
    }
    checked
}

pub fn smooth(_: &[f32]) -> Vec<bool> {
    Vec::new()
}
