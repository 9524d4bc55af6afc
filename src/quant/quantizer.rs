//! Quantization parameter selection
//!
//! Fits per-row affine `(scale, zero)` pairs for round-to-nearest quantization:
//! - **Min-max**: the observed range, always widened to include zero
//! - **MSE grid search**: shrinks the range in `grid` steps and keeps the
//!   candidate with the lowest `Σ|x - q(x)|^norm` per row
//!
//! Weights are fitted per output row. Activations are fitted per channel,
//! where the channel axis is the last one for `[T, C]` and `[B, S, C]` and
//! axis 1 for `[N, C, H, W]`.

use super::primitive::{fake_quantize, Maxq};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayView2, ArrayViewD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};

/// Quantizer configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    /// Bit width (1..=16)
    pub bits: u8,
    /// Fit one parameter pair per channel instead of per tensor
    pub per_channel: bool,
    /// Symmetric quantization (zero point fixed at `(maxq + 1) / 2`)
    pub symmetric: bool,
    /// Grid-search the clipping range to minimize the `norm` error
    pub use_mse_search: bool,
    /// Error exponent used by the MSE search
    pub norm: f64,
    /// Number of shrink steps per unit of range
    pub grid: usize,
    /// Largest fraction of the range the search may clip away
    pub max_shrink: f64,
    /// Reserved ternary mode
    pub trits: bool,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            per_channel: true,
            symmetric: true,
            use_mse_search: false,
            norm: 2.4,
            grid: 100,
            max_shrink: 0.8,
            trits: false,
        }
    }
}

impl QuantizerConfig {
    /// Create config for a bit width with default options
    pub fn new(bits: u8) -> Self {
        Self {
            bits,
            ..Self::default()
        }
    }

    pub fn with_per_channel(mut self, per_channel: bool) -> Self {
        self.per_channel = per_channel;
        self
    }

    pub fn with_symmetric(mut self, symmetric: bool) -> Self {
        self.symmetric = symmetric;
        self
    }

    pub fn with_mse_search(mut self, enabled: bool) -> Self {
        self.use_mse_search = enabled;
        self
    }

    /// Override the MSE search hyper-parameters
    pub fn with_search_grid(mut self, norm: f64, grid: usize, max_shrink: f64) -> Self {
        self.norm = norm;
        self.grid = grid;
        self.max_shrink = max_shrink;
        self
    }

    pub fn with_trits(mut self, trits: bool) -> Self {
        self.trits = trits;
        self
    }

    /// Reject unsupported bit-width/mode combinations
    pub fn validate(&self) -> Result<()> {
        if self.bits == 0 || self.bits > 16 {
            return Err(Error::ConfigError(format!(
                "unsupported bit width {} (must be 1..=16)",
                self.bits
            )));
        }
        if self.trits && self.use_mse_search {
            return Err(Error::ConfigError(
                "ternary mode cannot be combined with MSE search".to_string(),
            ));
        }
        if self.use_mse_search {
            if self.grid == 0 {
                return Err(Error::ConfigError("MSE search grid must be > 0".to_string()));
            }
            if !(self.max_shrink > 0.0 && self.max_shrink <= 1.0) {
                return Err(Error::ConfigError(format!(
                    "max_shrink {} must be in (0, 1]",
                    self.max_shrink
                )));
            }
            if !(self.norm.is_finite() && self.norm > 0.0) {
                return Err(Error::ConfigError(format!(
                    "norm {} must be finite and > 0",
                    self.norm
                )));
            }
        }
        Ok(())
    }

    /// Largest representable code for this configuration
    pub fn maxq(&self) -> Maxq {
        if self.trits {
            Maxq::Ternary
        } else {
            Maxq::from_bits(self.bits)
        }
    }
}

/// Fitted parameter state
#[derive(Clone, Debug)]
struct FittedParams {
    scale: ArrayD<f64>,
    zero: ArrayD<f64>,
}

/// Per-channel / per-tensor affine parameter search
#[derive(Clone, Debug)]
pub struct Quantizer {
    config: QuantizerConfig,
    maxq: Maxq,
    params: Option<FittedParams>,
}

impl Quantizer {
    /// Configure a quantizer. Fails on unsupported configurations.
    pub fn configure(config: QuantizerConfig) -> Result<Self> {
        config.validate()?;
        let maxq = config.maxq();
        Ok(Self {
            config,
            maxq,
            params: None,
        })
    }

    pub fn config(&self) -> &QuantizerConfig {
        &self.config
    }

    pub fn maxq(&self) -> Maxq {
        self.maxq
    }

    /// Fitted scale, broadcastable against the tensor passed to `find_params`
    pub fn scale(&self) -> Option<&ArrayD<f64>> {
        self.params.as_ref().map(|p| &p.scale)
    }

    /// Fitted zero point, broadcastable like [`Quantizer::scale`]
    pub fn zero(&self) -> Option<&ArrayD<f64>> {
        self.params.as_ref().map(|p| &p.zero)
    }

    /// True once parameters exist and no scale entry is zero
    pub fn ready(&self) -> bool {
        self.params
            .as_ref()
            .is_some_and(|p| !p.scale.is_empty() && p.scale.iter().all(|&s| s != 0.0))
    }

    /// Drop fitted parameters
    pub fn clear(&mut self) {
        self.params = None;
    }

    /// Fit parameters from a sample tensor.
    ///
    /// Weights must have rank >= 2 when fitted per channel; activations must
    /// have rank 2, 3 or 4.
    pub fn find_params(&mut self, x: ArrayViewD<f64>, is_weight: bool) -> Result<()> {
        let shape = x.shape().to_vec();
        if x.is_empty() {
            return Err(Error::InvalidParameter(
                "cannot fit quantization parameters on an empty tensor".to_string(),
            ));
        }
        if is_weight {
            if self.config.per_channel && shape.len() < 2 {
                return Err(Error::InvalidParameter(format!(
                    "per-channel weight fitting needs rank >= 2, got {shape:?}"
                )));
            }
        } else if !(2..=4).contains(&shape.len()) {
            return Err(Error::InvalidParameter(format!(
                "activation fitting needs rank 2, 3 or 4, got {shape:?}"
            )));
        }

        let rows = if self.config.per_channel {
            if is_weight {
                to_rows(&x, shape[0])?
            } else {
                channel_rows(&x)?
            }
        } else {
            to_rows(&x, 1)?
        };

        let (mut scale, mut zero) = self.fit_rows(rows.view());

        if !self.config.per_channel {
            let repeat = if is_weight {
                shape[0]
            } else if shape.len() == 3 {
                shape[2]
            } else {
                shape[1]
            };
            scale = Array1::from_elem(repeat, scale[0]);
            zero = Array1::from_elem(repeat, zero[0]);
        }

        let target: Vec<usize> = if is_weight {
            let mut s = vec![1; shape.len().max(2)];
            s[0] = scale.len();
            s
        } else {
            match shape.len() {
                4 => vec![1, scale.len(), 1, 1],
                3 => vec![1, 1, scale.len()],
                _ => vec![1, scale.len()],
            }
        };

        let scale = scale
            .into_shape_with_order(IxDyn(&target))
            .map_err(|e| Error::InvalidParameter(format!("scale reshape failed: {e}")))?;
        let zero = zero
            .into_shape_with_order(IxDyn(&target))
            .map_err(|e| Error::InvalidParameter(format!("zero reshape failed: {e}")))?;

        self.params = Some(FittedParams { scale, zero });
        Ok(())
    }

    /// Fit one parameter pair per row of a 2D weight slice and return them.
    ///
    /// This is the entry point used by the GPTQ column loop; the fitted
    /// parameters also become the quantizer's current state.
    pub fn find_weight_params(&mut self, w: ArrayView2<f64>) -> Result<(Array1<f64>, Array1<f64>)> {
        self.find_params(w.into_dyn(), true)?;
        self.row_params().ok_or_else(|| {
            Error::InvalidParameter("quantizer has no fitted parameters".to_string())
        })
    }

    /// Current parameters flattened to one entry per row/channel
    pub fn row_params(&self) -> Option<(Array1<f64>, Array1<f64>)> {
        self.params.as_ref().map(|p| {
            (
                p.scale.iter().copied().collect(),
                p.zero.iter().copied().collect(),
            )
        })
    }

    /// Fake-quantize a tensor with the fitted parameters
    pub fn fake_quantize(&self, x: ArrayViewD<f64>) -> Result<ArrayD<f64>> {
        let params = self.params.as_ref().ok_or_else(|| {
            Error::InvalidParameter("quantizer has no fitted parameters".to_string())
        })?;
        let scale = params.scale.broadcast(x.raw_dim()).ok_or_else(|| Error::ShapeMismatch {
            expected: params.scale.shape().to_vec(),
            got: x.shape().to_vec(),
        })?;
        let zero = params.zero.broadcast(x.raw_dim()).ok_or_else(|| Error::ShapeMismatch {
            expected: params.zero.shape().to_vec(),
            got: x.shape().to_vec(),
        })?;

        let maxq = self.maxq;
        let mut out = x.to_owned();
        Zip::from(&mut out)
            .and(&scale)
            .and(&zero)
            .for_each(|v, &s, &z| *v = fake_quantize(*v, s, z, maxq));
        Ok(out)
    }

    fn fit_rows(&self, x: ArrayView2<f64>) -> (Array1<f64>, Array1<f64>) {
        let rows = x.nrows();
        let symmetric = self.config.symmetric;
        let mut xmin = Array1::<f64>::zeros(rows);
        let mut xmax = Array1::<f64>::zeros(rows);

        for (r, row) in x.axis_iter(Axis(0)).enumerate() {
            let (lo, hi) = row
                .iter()
                .fold((0.0f64, 0.0f64), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            let (mut lo, mut hi) = (lo, hi);

            if symmetric {
                hi = lo.abs().max(hi);
                if lo < 0.0 {
                    lo = -hi;
                }
            }
            if lo == 0.0 && hi == 0.0 {
                lo = -1.0;
                hi = 1.0;
            }
            xmin[r] = lo;
            xmax[r] = hi;
        }

        let (mut scale, mut zero) = match self.maxq {
            Maxq::Ternary => (xmax.clone(), xmin.clone()),
            Maxq::Levels(_) => {
                let maxq = self.maxq.as_f64();
                let scale = (&xmax - &xmin) / maxq;
                let zero = if symmetric {
                    Array1::from_elem(rows, self.maxq.symmetric_zero())
                } else {
                    Zip::from(&xmin)
                        .and(&scale)
                        .map_collect(|&lo, &s| (-lo / s).round_ties_even())
                };
                (scale, zero)
            }
        };

        if self.config.use_mse_search {
            for (r, row) in x.axis_iter(Axis(0)).enumerate() {
                let (s, z) = self.search_row(row, xmin[r], xmax[r], zero[r]);
                if let Some(s) = s {
                    scale[r] = s;
                    zero[r] = z;
                }
            }
        }

        (scale, zero)
    }

    /// Grid search over shrunk ranges for one row. Returns the best candidate,
    /// or `None` when no candidate had a finite error.
    fn search_row(&self, row: ArrayView1<f64>, xmin: f64, xmax: f64, sym_zero: f64) -> (Option<f64>, f64) {
        let maxq = self.maxq.as_f64();
        let steps = (self.config.max_shrink * self.config.grid as f64) as usize;
        let mut best = f64::INFINITY;
        let mut best_params = (None, sym_zero);

        for i in 0..steps {
            let p = 1.0 - i as f64 / self.config.grid as f64;
            let lo = p * xmin;
            let hi = p * xmax;
            let scale = (hi - lo) / maxq;
            let zero = if self.config.symmetric {
                sym_zero
            } else {
                (-lo / scale).round_ties_even()
            };
            let err: f64 = row
                .iter()
                .map(|&v| (fake_quantize(v, scale, zero, self.maxq) - v).abs().powf(self.config.norm))
                .sum();
            if err < best {
                best = err;
                best_params = (Some(scale), zero);
            }
        }
        best_params
    }
}

/// Collect a tensor into `[rows, len / rows]` in logical (row-major) order
fn to_rows(x: &ArrayViewD<f64>, rows: usize) -> Result<Array2<f64>> {
    let cols = x.len() / rows.max(1);
    Array2::from_shape_vec((rows, cols), x.iter().copied().collect())
        .map_err(|e| Error::InvalidParameter(format!("cannot flatten {:?}: {e}", x.shape())))
}

/// Rows = activation channels
fn channel_rows(x: &ArrayViewD<f64>) -> Result<Array2<f64>> {
    let shape = x.shape();
    match shape.len() {
        4 => {
            let permuted = x.view().permuted_axes(IxDyn(&[1, 0, 2, 3]));
            to_rows(&permuted, shape[1])
        }
        _ => {
            let channels = shape[shape.len() - 1];
            let tokens = to_rows(x, x.len() / channels)?;
            Ok(tokens.t().to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3, Array4};
    use proptest::prelude::*;

    fn asym4() -> Quantizer {
        Quantizer::configure(QuantizerConfig::new(4).with_symmetric(false)).unwrap()
    }

    #[test]
    fn test_ready_false_before_find_params() {
        let q = asym4();
        assert!(!q.ready());
        assert!(q.scale().is_none());
    }

    #[test]
    fn test_ready_true_after_find_params() {
        let mut q = asym4();
        let w = array![[0.5, -1.0, 2.0], [3.0, 0.25, -0.75]];
        q.find_params(w.view().into_dyn(), true).unwrap();
        assert!(q.ready());
        assert_eq!(q.scale().unwrap().shape(), &[2, 1]);
    }

    #[test]
    fn test_asymmetric_range_includes_zero() {
        let mut q = asym4();
        // All-positive row: xmin is floored to 0
        let w = array![[1.0, 2.0, 3.0]];
        let (scale, zero) = q.find_weight_params(w.view()).unwrap();
        assert_abs_diff_eq!(scale[0], 3.0 / 15.0, epsilon = 1e-12);
        assert_eq!(zero[0], 0.0);
    }

    #[test]
    fn test_asymmetric_zero_point() {
        let mut q = asym4();
        let w = array![[-1.0, 0.5, 2.0]];
        let (scale, zero) = q.find_weight_params(w.view()).unwrap();
        assert_abs_diff_eq!(scale[0], 3.0 / 15.0, epsilon = 1e-12);
        // round(1.0 / 0.2) = 5
        assert_eq!(zero[0], 5.0);
    }

    #[test]
    fn test_symmetric_interval() {
        let mut q = Quantizer::configure(QuantizerConfig::new(4)).unwrap();
        let w = array![[-3.0, 1.0, 2.0]];
        let (scale, zero) = q.find_weight_params(w.view()).unwrap();
        assert_abs_diff_eq!(scale[0], 6.0 / 15.0, epsilon = 1e-12);
        assert_eq!(zero[0], 8.0);
    }

    #[test]
    fn test_degenerate_zero_range_has_nonzero_scale() {
        let mut q = asym4();
        let w = Array2::<f64>::zeros((3, 5));
        let (scale, zero) = q.find_weight_params(w.view()).unwrap();
        for &s in scale.iter() {
            assert!(s > 0.0);
            assert_abs_diff_eq!(s, 2.0 / 15.0, epsilon = 1e-12);
        }
        assert!((7.0..=8.0).contains(&zero[0]));
        assert!(q.ready());
    }

    #[test]
    fn test_per_tensor_weight_repeats_rows() {
        let mut q = Quantizer::configure(
            QuantizerConfig::new(8).with_per_channel(false).with_symmetric(false),
        )
        .unwrap();
        let w = array![[0.0, 1.0], [-2.0, 4.0], [0.5, 0.5]];
        let (scale, zero) = q.find_weight_params(w.view()).unwrap();
        assert_eq!(scale.len(), 3);
        assert!(scale.iter().all(|&s| s == scale[0]));
        assert!(zero.iter().all(|&z| z == zero[0]));
        assert_abs_diff_eq!(scale[0], 6.0 / 255.0, epsilon = 1e-12);
    }

    #[test]
    fn test_activation_rank3_uses_last_axis() {
        let mut q = asym4();
        let x = Array3::from_shape_fn((2, 3, 4), |(b, s, c)| (b * 3 + s) as f64 * (c as f64 + 1.0));
        q.find_params(x.view().into_dyn(), false).unwrap();
        let scale = q.scale().unwrap();
        assert_eq!(scale.shape(), &[1, 1, 4]);
        // Channel c max = 5 * (c + 1)
        for c in 0..4 {
            assert_abs_diff_eq!(scale[[0, 0, c]], 5.0 * (c as f64 + 1.0) / 15.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_activation_rank4_uses_axis_one() {
        let mut q = asym4();
        let x = Array4::from_shape_fn((2, 3, 2, 2), |(_, c, h, w)| (c + 1) as f64 * (h + w) as f64);
        q.find_params(x.view().into_dyn(), false).unwrap();
        let scale = q.scale().unwrap();
        assert_eq!(scale.shape(), &[1, 3, 1, 1]);
        assert_abs_diff_eq!(scale[[0, 2, 0, 0]], 6.0 / 15.0, epsilon = 1e-12);
    }

    #[test]
    fn test_activation_rank1_rejected() {
        let mut q = asym4();
        let x = array![1.0, 2.0];
        assert!(q.find_params(x.view().into_dyn(), false).is_err());
    }

    #[test]
    fn test_fake_quantize_broadcasts() {
        let mut q = asym4();
        let w = array![[-1.0, 0.0, 1.0], [0.0, 10.0, 5.0]];
        q.find_params(w.view().into_dyn(), true).unwrap();
        let fq = q.fake_quantize(w.view().into_dyn()).unwrap();
        assert_eq!(fq.shape(), w.shape());
        assert_abs_diff_eq!(fq[[1, 1]], 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(fq[[0, 1]], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mse_search_never_worse_than_min_max() {
        // Heavy outlier: clipping it should lower the p-norm error
        let mut row: Vec<f64> = (0..63).map(|i| (i as f64 / 63.0) - 0.5).collect();
        row.push(20.0);
        let w = Array2::from_shape_vec((1, 64), row).unwrap();

        let err = |q: &Quantizer| {
            let fq = q.fake_quantize(w.view().into_dyn()).unwrap();
            w.iter()
                .zip(fq.iter())
                .map(|(a, b)| (a - b).abs().powf(2.4))
                .sum::<f64>()
        };

        let mut plain = asym4();
        plain.find_params(w.view().into_dyn(), true).unwrap();
        let mut searched =
            Quantizer::configure(QuantizerConfig::new(4).with_symmetric(false).with_mse_search(true))
                .unwrap();
        searched.find_params(w.view().into_dyn(), true).unwrap();

        assert!(err(&searched) <= err(&plain) + 1e-12);
        assert!(searched.ready());
    }

    #[test]
    fn test_invalid_configurations() {
        assert!(Quantizer::configure(QuantizerConfig::new(0)).is_err());
        assert!(Quantizer::configure(QuantizerConfig::new(17)).is_err());
        assert!(Quantizer::configure(QuantizerConfig::new(4).with_trits(true).with_mse_search(true)).is_err());
        assert!(Quantizer::configure(
            QuantizerConfig::new(4).with_mse_search(true).with_search_grid(2.4, 0, 0.8)
        )
        .is_err());
        assert!(Quantizer::configure(
            QuantizerConfig::new(4).with_mse_search(true).with_search_grid(-1.0, 100, 0.8)
        )
        .is_err());
    }

    #[test]
    fn test_ternary_params() {
        let mut q = Quantizer::configure(QuantizerConfig::new(2).with_trits(true).with_symmetric(false)).unwrap();
        assert_eq!(q.maxq(), Maxq::Ternary);
        let w = array![[-2.0, 0.1, 3.0]];
        let (scale, zero) = q.find_weight_params(w.view()).unwrap();
        assert_eq!(scale[0], 3.0);
        assert_eq!(zero[0], -2.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_asymmetric_round_trip_within_half_step(
            values in proptest::collection::vec(-50.0f64..50.0, 2..64),
            bits in 2u8..9,
        ) {
            let n = values.len();
            let w = Array2::from_shape_vec((1, n), values.clone()).unwrap();
            let mut q = Quantizer::configure(QuantizerConfig::new(bits).with_symmetric(false)).unwrap();
            let (scale, _) = q.find_weight_params(w.view()).unwrap();
            let fq = q.fake_quantize(w.view().into_dyn()).unwrap();
            for (x, y) in values.iter().zip(fq.iter()) {
                prop_assert!((x - y).abs() <= scale[0] / 2.0 + 1e-9);
            }
        }

        #[test]
        fn prop_symmetric_round_trip_within_half_step(
            values in proptest::collection::vec(-50.0f64..50.0, 2..64),
            bits in 2u8..9,
        ) {
            let mut values = values;
            values.push(-1.0);
            let n = values.len();
            let w = Array2::from_shape_vec((1, n), values.clone()).unwrap();
            let mut q = Quantizer::configure(QuantizerConfig::new(bits)).unwrap();
            let (scale, _) = q.find_weight_params(w.view()).unwrap();
            let fq = q.fake_quantize(w.view().into_dyn()).unwrap();
            for (x, y) in values.iter().zip(fq.iter()) {
                prop_assert!((x - y).abs() <= scale[0] / 2.0 + 1e-9);
            }
        }

        #[test]
        fn prop_scale_always_positive(
            rows in 1usize..6,
            cols in 1usize..12,
            magnitude in 0.0f64..100.0,
        ) {
            let w = Array2::from_shape_fn((rows, cols), |(r, c)| magnitude * ((r * cols + c) as f64).sin());
            let mut q = asym4();
            let (scale, _) = q.find_weight_params(w.view()).unwrap();
            prop_assert!(scale.iter().all(|&s| s > 0.0 && s.is_finite()));
        }
    }
}
