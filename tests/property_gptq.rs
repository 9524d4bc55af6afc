//! Property-based tests for quantization invariants.
//!
//! Test categories:
//! 1. Round-to-nearest error is bounded by half a step inside the fitted range
//! 2. Output shape and code range match the input weight
//! 3. Activation ordering yields a valid permutation

use cuantizar::gptq::{FasterquantOptions, Gptq, GroupSize};
use cuantizar::quant::{Quantizer, QuantizerConfig};
use ndarray::Array2;
use proptest::prelude::*;

fn matrix(rows: usize, cols: usize) -> impl Strategy<Value = Array2<f64>> {
    proptest::collection::vec(-4.0f64..4.0, rows * cols)
        .prop_map(move |v| Array2::from_shape_vec((rows, cols), v).unwrap())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property 1: `|dequantize(quantize(x)) − x| ≤ scale/2` inside the range
    #[test]
    fn prop_fake_quantize_error_bounded(
        w in matrix(3, 16),
        bits in 2u8..=8,
        symmetric in any::<bool>(),
    ) {
        // Keep one negative entry per row so the symmetric range is two-sided
        let mut w = w;
        w.column_mut(0).mapv_inplace(|v| -v.abs() - 0.1);
        let mut quantizer = Quantizer::configure(QuantizerConfig::new(bits).with_symmetric(symmetric)).unwrap();
        quantizer.find_params(w.view().into_dyn(), true).unwrap();
        prop_assert!(quantizer.ready());

        let scale = quantizer.scale().unwrap().clone();
        let rounded = quantizer.fake_quantize(w.view().into_dyn()).unwrap();
        for ((idx, &x), &q) in w.indexed_iter().zip(rounded.iter()) {
            let s = scale[ndarray::IxDyn(&[idx.0, 0])];
            prop_assert!(s > 0.0);
            // The symmetric grid has one level fewer on the positive side
            let slack = if symmetric { s } else { 0.0 };
            prop_assert!((q - x).abs() <= s / 2.0 + slack + 1e-9, "x={} q={} scale={}", x, q, s);
        }
    }

    /// Property 2: codes keep the weight shape and stay in `[0, maxq]`
    #[test]
    fn prop_fasterquant_codes_in_range(
        w in matrix(4, 12),
        x in matrix(24, 12),
        bits in 2u8..=8,
        group in prop_oneof![Just(GroupSize::WholeRow), (1usize..=12).prop_map(GroupSize::Columns)],
        act_order in any::<bool>(),
    ) {
        let mut gptq = Gptq::new(12, QuantizerConfig::new(bits).with_symmetric(false)).unwrap();
        gptq.add_batch(x.view().into_dyn(), x.view().into_dyn()).unwrap();
        let options = FasterquantOptions { group_size: group, act_order, ..FasterquantOptions::default() };
        let out = gptq.fasterquant(w.view().into_dyn(), &options).unwrap();

        let maxq = f64::from((1u32 << bits) - 1);
        prop_assert_eq!(out.qweight().shape(), w.shape());
        prop_assert!(out.codes().iter().all(|&q| q.fract() == 0.0 && (0.0..=maxq).contains(&q)));
        prop_assert!(out.dequantize().unwrap().iter().all(|v| v.is_finite()));
        let groups = match group {
            GroupSize::WholeRow => 1,
            GroupSize::Columns(g) => 12usize.div_ceil(g),
        };
        prop_assert_eq!(out.num_groups(), groups);
    }

    /// Property 3: `perm` sorts the Hessian diagonal in descending order
    #[test]
    fn prop_act_order_sorts_diagonal(x in matrix(32, 8)) {
        let mut gptq = Gptq::new(8, QuantizerConfig::new(4)).unwrap();
        gptq.add_batch(x.view().into_dyn(), x.view().into_dyn()).unwrap();
        let diag = gptq.hessian().unwrap().diag().to_owned();

        let w = Array2::<f64>::ones((2, 8));
        let options = FasterquantOptions { act_order: true, ..FasterquantOptions::default() };
        let out = gptq.fasterquant(w.view().into_dyn(), &options).unwrap();
        let perm = out.perm().unwrap();
        for pair in perm.as_slice().unwrap().windows(2) {
            prop_assert!(diag[pair[0]] >= diag[pair[1]]);
            if diag[pair[0]] == diag[pair[1]] {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
