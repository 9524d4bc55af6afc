//! Quantization primitives
//!
//! Building blocks shared by the GPTQ engine and the driver:
//! - Affine quantize/dequantize with ties-to-even rounding
//! - Scale/zero-point search (min-max or MSE grid search)
//! - Error analysis of quantized layers
//! - Dequantization strategy registry

mod error_analysis;
mod primitive;
mod quantizer;
mod strategy;

pub use error_analysis::{analyze_error, relative_output_error, theoretical_sqnr, QuantErrorStats};
pub use primitive::{dequantize, fake_quantize, quantize, Maxq};
pub use quantizer::{Quantizer, QuantizerConfig};
pub use strategy::{
    DequantRegistry, DequantStrategy, Element, PackedLayer, Precision, QuantMode, StrategyKey,
    Topology,
};
