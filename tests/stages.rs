mod common;

use briny_kernels::approx::max_abs_diff;
use briny_kernels::backprop::{self, BatchNormGrads, ConvGrads};
use briny_kernels::finite_diff::weighted_sum;
use briny_kernels::{
    Activation, BatchStat, ConvParams, GradRequest, Layout, NormParams, OpError, PadMode, Tensor,
    tensor,
};
use common::{check_grad, rng, smooth, uniform, with_data};

#[test]
fn test_constant_pad_then_crop_restores() {
    let x = uniform(&mut rng(1), &[2, 3, 4, 5], -1.0, 1.0);
    let widths = [(1, 2), (3, 0)];
    let y = backprop::pad(&x, &widths, PadMode::Constant(0.0)).unwrap();
    assert_eq!(y.shape, vec![2, 3, 7, 8]);

    let mut cropped = Vec::new();
    for plane in y.data.chunks(7 * 8) {
        for row in plane.chunks(8).skip(1).take(4) {
            cropped.extend_from_slice(&row[3..8]);
        }
    }
    assert_eq!(cropped, x.data);
    let zeros = y.data.iter().filter(|v| **v == 0.0).count();
    assert_eq!(zeros, y.numel() - x.numel());
}

#[test]
fn test_pad_modes() {
    let x = tensor!([1.0, 2.0, 3.0]);
    let reflect = backprop::pad(&x, &[(2, 2)], PadMode::Reflect).unwrap();
    assert_eq!(reflect.data, vec![3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0]);
    let repeat = backprop::pad(&x, &[(2, 1)], PadMode::Repeat).unwrap();
    assert_eq!(repeat.data, vec![1.0, 1.0, 1.0, 2.0, 3.0, 3.0]);
    let constant = backprop::pad(&x, &[(1, 1)], PadMode::Constant(9.0)).unwrap();
    assert_eq!(constant.data, vec![9.0, 1.0, 2.0, 3.0, 9.0]);
}

#[test]
fn test_pad_backward_sums_shared_sources() {
    let x = tensor!([1.0, 2.0, 3.0]);
    for (mode, expected) in [
        (PadMode::Repeat, vec![3.0, 1.0, 3.0]),
        (PadMode::Reflect, vec![2.0, 3.0, 2.0]),
        (PadMode::Constant(5.0), vec![1.0, 1.0, 1.0]),
    ] {
        let dy = Tensor::full(vec![7], 1.0);
        let mut dx = Tensor::zeros(vec![3]);
        backprop::pad_backward(&x, &[(2, 2)], mode, &dy, &mut (&mut dx).into()).unwrap();
        assert_eq!(dx.data, expected, "{mode:?}");
        let total = if matches!(mode, PadMode::Constant(_)) { 3.0 } else { 7.0 };
        assert_eq!(dx.data.iter().sum::<f32>(), total);
    }
}

#[test]
fn test_pad_rejects_malformed_requests() {
    let empty = Tensor::zeros(vec![2, 0]);
    assert!(matches!(
        backprop::pad(&empty, &[(1, 1)], PadMode::Reflect),
        Err(OpError::InvalidArgument { .. })
    ));
    assert_eq!(backprop::pad(&empty, &[(1, 1)], PadMode::Constant(0.0)).unwrap().shape, vec![2, 2]);
    assert!(matches!(
        backprop::pad(&empty, &[(1, 1), (1, 1), (1, 1)], PadMode::Repeat),
        Err(OpError::InvalidArgument { .. })
    ));
}

#[test]
fn test_oversized_padding_is_an_error() {
    let x = Tensor::zeros(vec![1, 3]);
    for mode in [PadMode::Repeat, PadMode::Reflect, PadMode::Constant(0.0)] {
        assert!(matches!(
            backprop::pad(&x, &[(usize::MAX, 1)], mode),
            Err(OpError::InvalidArgument { .. })
        ));
    }

    let mut dx = Tensor::full(vec![1, 3], 2.0);
    let err = backprop::pad_backward(
        &x,
        &[(usize::MAX, 1)],
        PadMode::Repeat,
        &Tensor::zeros(vec![1, 3]),
        &mut (&mut dx).into(),
    )
    .unwrap_err();
    assert!(matches!(err, OpError::InvalidArgument { .. }));
    assert_eq!(dx.data, vec![2.0; 3]);

    let w = Tensor::zeros(vec![2, 1, 1]);
    let params = ConvParams::default().with_pad(vec![usize::MAX]);
    assert!(matches!(
        backprop::convolution(&x.reshape(vec![1, 1, 3]).unwrap(), &w, None, &params),
        Err(OpError::InvalidArgument { .. })
    ));
}

#[test]
fn test_oversized_dilation_is_an_error() {
    let x = Tensor::zeros(vec![1, 4, 5]);
    let w = Tensor::zeros(vec![6, 2, 3]);
    let params = ConvParams::default().with_group(2).with_dilation(vec![usize::MAX / 2 + 1]);
    assert!(matches!(
        backprop::convolution(&x, &w, None, &params),
        Err(OpError::ShapeMismatch { .. })
    ));

    let mut dw = Tensor::full(vec![6, 2, 3], 1.0);
    let mut grads = ConvGrads {
        weight: (&mut dw).into(),
        ..ConvGrads::new()
    };
    let dy = Tensor::zeros(vec![1, 6, 3]);
    let err = backprop::convolution_backward(&x, &w, None, &params, &dy, &mut grads).unwrap_err();
    assert!(matches!(err, OpError::ShapeMismatch { .. }));
    assert_eq!(dw.data, vec![1.0; 36]);
}

#[test]
fn test_output_shape_law() {
    let x = Tensor::zeros(vec![2, 4, 7, 7]);
    let w = Tensor::zeros(vec![6, 2, 3, 3]);
    // floor((in + pads - 1 - d * (k - 1)) / s) + 1
    for (pad, dilation, expected) in [
        (vec![1, 1], vec![1, 1], 4),
        (vec![2, 1, 2, 1], vec![1, 1], 4),
        (vec![0, 0], vec![2, 2], 2),
        (vec![1, 2, 1, 2], vec![2, 2], 3),
    ] {
        let params = ConvParams::default()
            .with_pad(pad.clone())
            .with_stride(vec![2, 2])
            .with_dilation(dilation)
            .with_group(2);
        let y = backprop::convolution(&x, &w, None, &params).unwrap();
        assert_eq!(y.shape, vec![2, 6, expected, expected], "pad {pad:?}");
    }
}

#[test]
fn test_convolution_gradients_match_finite_differences() {
    let mut r = rng(2);
    // leading batch axes are folded: base axis 2
    let x = uniform(&mut r, &[2, 1, 6, 7], -1.0, 1.0);
    let w = uniform(&mut r, &[4, 3, 2], -1.0, 1.0);
    let b = uniform(&mut r, &[4], -1.0, 1.0);
    let params = ConvParams::default()
        .with_base_axis(2)
        .with_pad(vec![1, 2])
        .with_stride(vec![2])
        .with_dilation(vec![3])
        .with_group(2);
    let y = backprop::convolution(&x, &w, Some(&b), &params).unwrap();
    // 7 + 3 = 10, span 4: (10 - 4) / 2 + 1
    assert_eq!(y.shape, vec![2, 1, 4, 4]);

    let rw = uniform(&mut r, &[2, 1, 4, 4], -1.0, 1.0);
    let (mut dx, mut dw, mut db) =
        (Tensor::zeros(x.shape.clone()), Tensor::zeros(w.shape.clone()), Tensor::zeros(vec![4]));
    let mut grads = ConvGrads {
        x: (&mut dx).into(),
        weight: (&mut dw).into(),
        bias: (&mut db).into(),
    };
    backprop::convolution_backward(&x, &w, Some(&b), &params, &rw, &mut grads).unwrap();

    let loss = |x: &Tensor, w: &Tensor, b: &Tensor| {
        weighted_sum(&backprop::convolution(x, w, Some(b), &params).unwrap().data, &rw.data)
    };
    check_grad("dx", &x.data, &dx.data, |p| loss(&with_data(&x, p), &w, &b), smooth);
    check_grad("dw", &w.data, &dw.data, |p| loss(&x, &with_data(&w, p), &b), smooth);
    check_grad("db", &b.data, &db.data, |p| loss(&x, &w, &with_data(&b, p)), smooth);
}

#[test]
fn test_channel_last_convolution() {
    let mut r = rng(3);
    let x = uniform(&mut r, &[2, 4, 5, 5], -1.0, 1.0);
    let w = uniform(&mut r, &[6, 2, 3, 3], -1.0, 1.0);
    let params = ConvParams::default().with_pad(vec![1, 1]).with_group(2);
    let y = backprop::convolution(&x, &w, None, &params).unwrap();

    let last = |t: &Tensor| t.move_axis(1, t.ndim() - 1);
    let cl = params.clone().with_layout(Layout::ChannelLast);
    let y_cl = backprop::convolution(&last(&x), &last(&w), None, &cl).unwrap();
    assert_eq!(y_cl.shape, vec![2, 5, 5, 6]);
    assert!(max_abs_diff(&y_cl.data, &last(&y).data) < 1e-6);
}

#[test]
fn test_convolution_errors() {
    let x = Tensor::zeros(vec![1, 4, 5]);
    let w = Tensor::zeros(vec![6, 2, 3]);
    let params = ConvParams::default().with_group(2);
    assert!(backprop::convolution(&x, &w, None, &params).is_ok());
    assert!(matches!(
        backprop::convolution(&x, &Tensor::zeros(vec![5, 2, 3]), None, &params),
        Err(OpError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        backprop::convolution(&x, &w, Some(&Tensor::zeros(vec![4])), &params),
        Err(OpError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        backprop::convolution(&x, &w, None, &params.clone().with_dilation(vec![3])),
        Err(OpError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        backprop::convolution(&x, &w, None, &params.with_stride(vec![1, 1])),
        Err(OpError::InvalidArgument { .. })
    ));
}

#[test]
fn test_activation_table() {
    let x = Tensor::new(vec![4], vec![-2.0, 0.0, 0.5, 7.0]);
    let cases = [
        (Activation::Identity, [-2.0, 0.0, 0.5, 7.0]),
        (Activation::Relu, [0.0, 0.0, 0.5, 7.0]),
        (Activation::LeakyRelu(0.1), [-0.2, 0.0, 0.5, 7.0]),
        (Activation::Relu6, [0.0, 0.0, 0.5, 6.0]),
    ];
    for (f, expected) in cases {
        let y = backprop::activation(&x, f);
        for (a, b) in y.data.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6, "{f:?}: {a} vs {b}");
        }
    }
    let elu = backprop::activation(&x, Activation::Elu(1.0));
    assert!((elu.data[0] - ((-2.0f32).exp() - 1.0)).abs() < 1e-6);
    let sig = backprop::activation(&x, Activation::Sigmoid);
    assert!((sig.data[1] - 0.5).abs() < 1e-6);
    let tanh = backprop::activation(&x, Activation::Tanh);
    assert!((tanh.data[2] - 0.5f32.tanh()).abs() < 1e-6);
}

#[test]
fn test_activation_derivatives_match_finite_differences() {
    let x = uniform(&mut rng(4), &[64], -8.0, 8.0);
    let r = uniform(&mut rng(40), &[64], -1.0, 1.0);
    for f in [
        Activation::Identity,
        Activation::Relu,
        Activation::Sigmoid,
        Activation::Tanh,
        Activation::LeakyRelu(0.2),
        Activation::Elu(1.5),
        Activation::Relu6,
    ] {
        let mut dx = Tensor::zeros(vec![64]);
        backprop::activation_backward(&x, f, &r, &mut (&mut dx).into()).unwrap();
        let loss =
            |p: &[f32]| weighted_sum(&backprop::activation(&with_data(&x, p), f).data, &r.data);
        // which side of each kink every element is on
        let region = |p: &[f32]| -> Vec<bool> {
            p.iter().flat_map(|v| f.kinks().iter().map(move |k| v > k)).collect()
        };
        let n = check_grad(f.tag(), &x.data, &dx.data, loss, region);
        assert!(n >= 60, "{f:?}: only {n} coordinates checked");
    }
}

#[test]
fn test_relu6_is_flat_at_both_kinks() {
    let x = tensor!([0.0, 6.0]);
    let dy = Tensor::full(vec![2], 1.0);
    let mut dx = Tensor::zeros(vec![2]);
    backprop::activation_backward(&x, Activation::Relu6, &dy, &mut (&mut dx).into()).unwrap();
    assert_eq!(dx.data, vec![0.0, 0.0]);
}

#[test]
fn test_batch_normalization_gradients() {
    let mut r = rng(5);
    let x = uniform(&mut r, &[3, 2, 4], -2.0, 2.0);
    let beta = uniform(&mut r, &[1, 2, 1], -0.5, 0.5);
    let gamma = uniform(&mut r, &[1, 2, 1], 0.5, 1.5);
    let mean = uniform(&mut r, &[1, 2, 1], -0.5, 0.5);
    let var = uniform(&mut r, &[1, 2, 1], 0.5, 1.5);
    let rw = uniform(&mut r, &[3, 2, 4], -1.0, 1.0);

    for batch_stat in [BatchStat::Train, BatchStat::Eval] {
        let params = NormParams {
            batch_stat,
            ..NormParams::default()
        };
        let running = batch_stat == BatchStat::Eval;
        let zeros = |t: &Tensor| Tensor::zeros(t.shape.clone());
        let (mut dx, mut dbeta, mut dgamma, mut dmean, mut dvar) =
            (zeros(&x), zeros(&beta), zeros(&gamma), zeros(&mean), zeros(&var));
        let mut grads = BatchNormGrads {
            x: (&mut dx).into(),
            beta: (&mut dbeta).into(),
            gamma: (&mut dgamma).into(),
            ..BatchNormGrads::new()
        };
        if running {
            grads.running_mean = (&mut dmean).into();
            grads.running_var = (&mut dvar).into();
        }
        let (m, v) = (&mean, &var);
        backprop::batch_normalization_backward(&x, &beta, &gamma, m, v, &params, &rw, &mut grads)
            .unwrap();
        assert_eq!(dgamma.shape, vec![1, 2, 1]);

        let loss = |x: &Tensor, beta: &Tensor, gamma: &Tensor, mean: &Tensor, var: &Tensor| {
            let (mut m, mut v) = (mean.clone(), var.clone());
            let y = backprop::batch_normalization(x, beta, gamma, &mut m, &mut v, &params).unwrap();
            weighted_sum(&y.data, &rw.data)
        };
        let at = |t: &Tensor, p: &[f32]| with_data(t, p);
        check_grad("dx", &x.data, &dx.data, |p| {
            loss(&at(&x, p), &beta, &gamma, &mean, &var)
        }, smooth);
        check_grad("dbeta", &beta.data, &dbeta.data, |p| {
            loss(&x, &at(&beta, p), &gamma, &mean, &var)
        }, smooth);
        check_grad("dgamma", &gamma.data, &dgamma.data, |p| {
            loss(&x, &beta, &at(&gamma, p), &mean, &var)
        }, smooth);
        if running {
            check_grad("dmean", &mean.data, &dmean.data, |p| {
                loss(&x, &beta, &gamma, &at(&mean, p), &var)
            }, smooth);
            check_grad("dvar", &var.data, &dvar.data, |p| {
                loss(&x, &beta, &gamma, &mean, &at(&var, p))
            }, smooth);
        }
    }
}

#[test]
fn test_batch_normalization_statistics() {
    let x = Tensor::new(vec![4, 1], vec![1.0, 2.0, 3.0, 6.0]);
    let beta = Tensor::zeros(vec![1]);
    let gamma = Tensor::full(vec![1], 1.0);
    let params = NormParams {
        decay_rate: 0.5,
        eps: 0.0,
        ..NormParams::default()
    };

    let (mut mean, mut var) = (Tensor::zeros(vec![1]), Tensor::full(vec![1], 1.0));
    let y = backprop::batch_normalization(&x, &beta, &gamma, &mut mean, &mut var, &params).unwrap();
    // batch mean 3, biased var 3.5, unbiased 14/3
    assert!((y.data[0] + 2.0 / 3.5f32.sqrt()).abs() < 1e-6);
    assert!((mean.data[0] - 1.5).abs() < 1e-6);
    assert!((var.data[0] - (0.5 + 0.5 * 14.0 / 3.0)).abs() < 1e-5);

    let eval = NormParams {
        batch_stat: BatchStat::Eval,
        ..params
    };
    let before = (mean.clone(), var.clone());
    backprop::batch_normalization(&x, &beta, &gamma, &mut mean, &mut var, &eval).unwrap();
    assert_eq!((mean, var), before);
}

#[test]
fn test_batch_normalization_rejects_bad_parameters() {
    let x = Tensor::zeros(vec![2, 3]);
    let (beta, gamma) = (Tensor::zeros(vec![3]), Tensor::full(vec![3], 1.0));
    let (mut mean, mut var) = (Tensor::zeros(vec![2]), Tensor::full(vec![3], 1.0));
    let params = NormParams::default();
    assert!(matches!(
        backprop::batch_normalization(&x, &beta, &gamma, &mut mean, &mut var, &params),
        Err(OpError::ShapeMismatch { .. })
    ));

    let mut mean = Tensor::zeros(vec![3]);
    let bad = NormParams { eps: -1.0, ..params };
    assert!(matches!(
        backprop::batch_normalization(&x, &beta, &gamma, &mut mean, &mut var, &bad),
        Err(OpError::InvalidArgument { .. })
    ));
    let bad = NormParams { axis: 2, ..params };
    assert!(matches!(
        backprop::batch_normalization(&x, &beta, &gamma, &mut mean, &mut var, &bad),
        Err(OpError::InvalidArgument { .. })
    ));
}

#[test]
fn test_residual_addition() {
    let a = tensor!([[1.0, 2.0], [3.0, 4.0]]);
    let b = Tensor::full(vec![2, 2], 0.5);
    assert_eq!(backprop::add2(&a, &b).unwrap().data, vec![1.5, 2.5, 3.5, 4.5]);

    let err = backprop::add2(&a, &Tensor::zeros(vec![4])).unwrap_err();
    assert!(matches!(err, OpError::ShapeMismatch { .. }));
    assert_eq!(err.op(), "add2");

    let dy = Tensor::full(vec![2, 2], 2.0);
    let mut da = Tensor::zeros(vec![2, 2]);
    backprop::add2_backward(&a, &b, &dy, &mut (&mut da).into(), &mut GradRequest::Skip).unwrap();
    assert_eq!(da.data, vec![2.0; 4]);
}
