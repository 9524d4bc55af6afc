//! Affine quantize/dequantize primitive
//!
//! Shared by the parameter search and the GPTQ column loop:
//! - `quantize`: `clamp(round(x / scale) + zero, 0, maxq)`
//! - `dequantize`: `scale * (q - zero)`
//!
//! Rounding is ties-to-even so results are reproducible against reference
//! tensor libraries. Ternary mode has its own three-level mapping.

use serde::{Deserialize, Serialize};

/// Largest representable integer code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Maxq {
    /// `2^bits - 1` affine levels
    Levels(u32),
    /// Unbounded ternary ("trits") mode: codes {0, 1, 2} map to {zero, 0, scale}
    Ternary,
}

impl Maxq {
    /// Affine levels for a bit width
    pub fn from_bits(bits: u8) -> Self {
        Maxq::Levels((1u32 << bits) - 1)
    }

    /// Largest code as a float
    pub fn as_f64(&self) -> f64 {
        match self {
            Maxq::Levels(m) => *m as f64,
            Maxq::Ternary => 2.0,
        }
    }

    /// Zero point used by symmetric quantization: `(maxq + 1) / 2`
    pub fn symmetric_zero(&self) -> f64 {
        match self {
            Maxq::Levels(m) => (*m as f64 + 1.0) / 2.0,
            Maxq::Ternary => 1.0,
        }
    }

    pub fn is_ternary(&self) -> bool {
        matches!(self, Maxq::Ternary)
    }
}

/// Quantize a single value to its integer code (returned as a float).
#[inline]
pub fn quantize(x: f64, scale: f64, zero: f64, maxq: Maxq) -> f64 {
    match maxq {
        Maxq::Levels(m) => ((x / scale).round_ties_even() + zero).clamp(0.0, m as f64),
        Maxq::Ternary => {
            if x > scale / 2.0 {
                2.0
            } else if x < zero / 2.0 {
                0.0
            } else {
                1.0
            }
        }
    }
}

/// Map an integer code back to the real line.
#[inline]
pub fn dequantize(q: f64, scale: f64, zero: f64, maxq: Maxq) -> f64 {
    match maxq {
        Maxq::Levels(_) => scale * (q - zero),
        Maxq::Ternary => match q as i64 {
            2 => scale,
            0 => zero,
            _ => 0.0,
        },
    }
}

/// Quantize then dequantize.
#[inline]
pub fn fake_quantize(x: f64, scale: f64, zero: f64, maxq: Maxq) -> f64 {
    dequantize(quantize(x, scale, zero, maxq), scale, zero, maxq)
}
