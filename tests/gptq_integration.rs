//! Integration tests for the GPTQ engine.
//!
//! Exercises accumulation, `fasterquant` and dequantization through the
//! public API only.

use approx::assert_abs_diff_eq;
use cuantizar::gptq::{EngineState, FasterquantOptions, Gptq, GroupSize};
use cuantizar::quant::{relative_output_error, Quantizer, QuantizerConfig};
use cuantizar::Error;
use half::f16;
use ndarray::{Array2, Array3, Axis};

/// Correlated calibration rows, `offset` shifts the sequence position
fn inputs(rows: usize, offset: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        let t = (offset + r) as f64;
        (0.37 * t + 1.3 * c as f64).sin() + 0.5 * (0.11 * t * (c + 1) as f64).cos()
    })
}

fn weight() -> Array2<f32> {
    Array2::from_shape_fn((4, 8), |(i, j)| (1.7 * i as f32 + 0.9 * j as f32).sin())
}

fn asymmetric_4bit() -> QuantizerConfig {
    QuantizerConfig::new(4).with_symmetric(false)
}

fn calibrated(config: QuantizerConfig) -> (Gptq, Array2<f64>) {
    let first = inputs(16, 0, 8);
    let second = inputs(16, 16, 8);
    let mut gptq = Gptq::new(8, config).unwrap();
    gptq.add_batch(first.view().into_dyn(), first.view().into_dyn()).unwrap();
    gptq.add_batch(second.view().into_dyn(), second.view().into_dyn()).unwrap();
    let all = ndarray::concatenate(Axis(0), &[first.view(), second.view()]).unwrap();
    (gptq, all)
}

#[test]
fn test_end_to_end_output_error_within_five_percent() {
    let (mut gptq, x) = calibrated(asymmetric_4bit());
    assert_eq!(gptq.nsamples(), 32);

    let w = weight();
    let out = gptq
        .fasterquant(w.view().into_dyn(), &FasterquantOptions::default())
        .unwrap();
    let dequantized = out.dequantize().unwrap();

    let reference = w.mapv(f64::from);
    let err = relative_output_error(x.view(), reference.view(), dequantized.view()).unwrap();
    assert!(err < 0.05, "relative output error {err}");
    assert_eq!(gptq.state(), EngineState::Quantized);
}

#[test]
fn test_error_compensation_beats_round_to_nearest() {
    let (mut gptq, x) = calibrated(asymmetric_4bit());
    let w = weight().mapv(f64::from);
    let out = gptq
        .fasterquant(w.view().into_dyn(), &FasterquantOptions::default())
        .unwrap();
    let gptq_err =
        relative_output_error(x.view(), w.view(), out.dequantize().unwrap().view()).unwrap();

    let mut rtn = Quantizer::configure(asymmetric_4bit()).unwrap();
    rtn.find_params(w.view().into_dyn(), true).unwrap();
    let rounded = rtn
        .fake_quantize(w.view().into_dyn())
        .unwrap()
        .into_dimensionality::<ndarray::Ix2>()
        .unwrap();
    let rtn_err = relative_output_error(x.view(), w.view(), rounded.view()).unwrap();

    assert!(gptq_err < rtn_err, "gptq {gptq_err} vs rtn {rtn_err}");
}

#[test]
fn test_hessian_is_chunk_invariant() {
    let (split, x) = calibrated(asymmetric_4bit());
    let mut whole = Gptq::new(8, asymmetric_4bit()).unwrap();
    whole.add_batch(x.view().into_dyn(), x.view().into_dyn()).unwrap();

    let a = split.hessian().unwrap();
    let b = whole.hessian().unwrap();
    for (u, v) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(u, v, epsilon = 1e-12);
    }
    // H = 2·XᵀX / n
    let expected = x.t().dot(&x) * (2.0 / 32.0);
    for (u, v) in a.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(u, v, epsilon = 1e-12);
    }
}

#[test]
fn test_dead_channel_dequantizes_to_exact_zero() {
    let mut x = inputs(32, 0, 8);
    x.column_mut(2).fill(0.0);
    let mut gptq = Gptq::new(8, asymmetric_4bit()).unwrap();
    gptq.add_batch(x.view().into_dyn(), x.view().into_dyn()).unwrap();

    let out = gptq
        .fasterquant(weight().view().into_dyn(), &FasterquantOptions::default())
        .unwrap();
    let dequantized = out.dequantize().unwrap();
    for r in 0..4 {
        assert_eq!(dequantized[[r, 2]], 0.0);
        assert_eq!(out.codes()[[r, 2]], out.zero_points()[[r, 0]]);
    }
    assert!(dequantized.iter().all(|v| v.is_finite()));
}

#[test]
fn test_act_order_permutation_round_trips() {
    let (mut gptq, _) = calibrated(asymmetric_4bit());
    let options = FasterquantOptions {
        act_order: true,
        group_size: GroupSize::Columns(4),
        ..FasterquantOptions::default()
    };
    let out = gptq.fasterquant(weight().view().into_dyn(), &options).unwrap();

    let perm = out.perm().unwrap();
    let invperm = out.invperm().unwrap();
    let mut sorted = perm.to_vec();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..8).collect::<Vec<_>>());
    for j in 0..8 {
        assert_eq!(perm[invperm[j]], j);
        assert_eq!(invperm[perm[j]], j);
    }

    // Every column is reconstructed with the group g_idx points at
    let g_idx = out.g_idx();
    let dequantized = out.dequantize().unwrap();
    for r in 0..4 {
        for j in 0..8 {
            let g = g_idx[j];
            let expected = out.scale()[[r, g]] * (out.codes()[[r, j]] - out.zero_points()[[r, g]]);
            assert_abs_diff_eq!(dequantized[[r, j]], expected, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_group_counts() {
    let x = inputs(32, 0, 12);
    let w = Array2::from_shape_fn((3, 12), |(i, j)| ((i * 12 + j) as f64 * 0.41).sin());
    for (group_size, groups) in [
        (GroupSize::WholeRow, 1),
        (GroupSize::Columns(4), 3),
        (GroupSize::Columns(5), 3),
        (GroupSize::Columns(12), 1),
    ] {
        let mut gptq = Gptq::new(12, asymmetric_4bit()).unwrap();
        gptq.add_batch(x.view().into_dyn(), x.view().into_dyn()).unwrap();
        let options = FasterquantOptions {
            group_size,
            ..FasterquantOptions::default()
        };
        let out = gptq.fasterquant(w.view().into_dyn(), &options).unwrap();
        assert_eq!(out.num_groups(), groups, "{group_size}");
        assert_eq!(out.scale().dim(), (3, groups));
        assert!(out.g_idx().iter().all(|&g| g < groups));
    }
}

#[test]
fn test_half_precision_conv_weight_keeps_shape_and_type() {
    let (mut gptq, _) = calibrated(QuantizerConfig::new(3));
    let w = Array3::from_shape_fn((4, 2, 4), |(o, i, k)| f16::from_f32(((o * 8 + i * 4 + k) as f32 * 0.3).cos()));
    let out = gptq
        .fasterquant(w.view().into_dyn(), &FasterquantOptions::default())
        .unwrap();

    let qweight: &ndarray::ArrayD<f16> = out.qweight();
    assert_eq!(qweight.shape(), &[4, 2, 4]);
    assert!(qweight.iter().all(|q| {
        let v = q.to_f32();
        v.fract() == 0.0 && (0.0..=7.0).contains(&v)
    }));
    assert!(out.zero().is_none());
}

#[test]
fn test_not_positive_definite_can_be_retried() {
    let h = ndarray::array![[1.0, 2.0], [2.0, 1.0]];
    let mut gptq = Gptq::with_hessian(h, 8, asymmetric_4bit()).unwrap();
    let w = ndarray::array![[0.5, -0.5]];
    let undamped = FasterquantOptions {
        damp_fraction: 0.0,
        ..FasterquantOptions::default()
    };
    assert!(matches!(
        gptq.fasterquant(w.view().into_dyn(), &undamped),
        Err(Error::NotPositiveDefinite { index: 1, .. })
    ));
    assert_eq!(gptq.state(), EngineState::Accumulating);

    let damped = FasterquantOptions {
        damp_fraction: 2.0,
        ..FasterquantOptions::default()
    };
    assert!(gptq.fasterquant(w.view().into_dyn(), &damped).is_ok());
}

#[test]
fn test_quantized_engine_rejects_more_batches() {
    let (mut gptq, x) = calibrated(asymmetric_4bit());
    gptq.fasterquant(weight().view().into_dyn(), &FasterquantOptions::default())
        .unwrap();
    assert!(matches!(
        gptq.add_batch(x.view().into_dyn(), x.view().into_dyn()),
        Err(Error::InvalidState { .. })
    ));
}
