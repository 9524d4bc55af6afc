//! Quantization Error Analysis
//!
//! Measures how far a quantized layer drifts from its full-precision original:
//! - Weight-space error statistics (MSE, MAE, max error, SQNR)
//! - Output-space error on real activations, `‖XWᵀ − XŴᵀ‖ / ‖XWᵀ‖`

use crate::{Error, Result};
use ndarray::{ArrayView2, Zip};
use serde::{Deserialize, Serialize};

/// Error statistics for quantization analysis
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantErrorStats {
    /// Mean Squared Error
    pub mse: f64,
    /// Mean Absolute Error
    pub mae: f64,
    /// Maximum absolute error
    pub max_error: f64,
    /// Signal-to-Quantization-Noise Ratio (SQNR) in dB, infinite for exact
    /// reconstructions
    #[serde(with = "unbounded")]
    pub sqnr_db: f64,
    /// Fraction of values with error > threshold
    pub outlier_rate: f64,
    /// Number of samples
    pub num_samples: usize,
}

impl QuantErrorStats {
    /// Root Mean Squared Error
    pub fn rmse(&self) -> f64 {
        self.mse.sqrt()
    }
}

/// Infinite values round-trip through formats without an infinity literal
mod unbounded {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

/// Analyze the elementwise error between two equally shaped matrices
///
/// # Arguments
/// * `original` - Full-precision values
/// * `dequantized` - Reconstructed values
/// * `outlier_threshold` - Error threshold for outlier detection
pub fn analyze_error(
    original: ArrayView2<f64>,
    dequantized: ArrayView2<f64>,
    outlier_threshold: f64,
) -> Result<QuantErrorStats> {
    if original.shape() != dequantized.shape() {
        return Err(Error::ShapeMismatch {
            expected: original.shape().to_vec(),
            got: dequantized.shape().to_vec(),
        });
    }
    if original.is_empty() {
        return Ok(QuantErrorStats::default());
    }

    let n = original.len() as f64;
    let mut sq_sum = 0.0;
    let mut abs_sum = 0.0;
    let mut max_error = 0.0f64;
    let mut outliers = 0usize;
    let mut signal = 0.0;

    Zip::from(&original).and(&dequantized).for_each(|&o, &d| {
        let e = (o - d).abs();
        sq_sum += e * e;
        abs_sum += e;
        max_error = max_error.max(e);
        if e > outlier_threshold {
            outliers += 1;
        }
        signal += o * o;
    });

    let mse = sq_sum / n;
    // SQNR = 10 * log10(signal_power / noise_power)
    let sqnr_db = if mse > 1e-20 {
        10.0 * ((signal / n) / mse).log10()
    } else {
        f64::INFINITY
    };

    Ok(QuantErrorStats {
        mse,
        mae: abs_sum / n,
        max_error,
        sqnr_db,
        outlier_rate: outliers as f64 / n,
        num_samples: original.len(),
    })
}

/// Relative Frobenius error of a layer's output on the given inputs.
///
/// `inputs` is `[tokens, in]`, both weights are `[out, in]`.
pub fn relative_output_error(
    inputs: ArrayView2<f64>,
    weight: ArrayView2<f64>,
    dequantized: ArrayView2<f64>,
) -> Result<f64> {
    if weight.shape() != dequantized.shape() {
        return Err(Error::ShapeMismatch {
            expected: weight.shape().to_vec(),
            got: dequantized.shape().to_vec(),
        });
    }
    if inputs.ncols() != weight.ncols() {
        return Err(Error::ShapeMismatch {
            expected: vec![inputs.nrows(), weight.ncols()],
            got: inputs.shape().to_vec(),
        });
    }

    let reference = inputs.dot(&weight.t());
    let approx = inputs.dot(&dequantized.t());
    let num = (&reference - &approx).mapv(|v| v * v).sum().sqrt();
    let den = reference.mapv(|v| v * v).sum().sqrt();
    if den < f64::EPSILON {
        return Ok(if num < f64::EPSILON { 0.0 } else { f64::INFINITY });
    }
    Ok(num / den)
}

/// Calculate expected SQNR for uniform quantization
///
/// Theoretical SQNR for b-bit quantization: 6.02 * b + 1.76 dB
pub fn theoretical_sqnr(bits: u8) -> f64 {
    6.02 * bits as f64 + 1.76
}
