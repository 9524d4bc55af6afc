//! # Cuantizar: GPTQ Post-Training Weight Quantization
//!
//! Cuantizar compresses the weights of linear layers to low-bit integers
//! while keeping the layer output close to the original, using second-order
//! (Hessian-based) error compensation.
//!
//! ## Architecture
//!
//! - **quant**: Scale/zero-point selection, fake quantization, error analysis
//!   and the dequantization strategy registry
//! - **gptq**: Hessian accumulation, Cholesky helpers and the `fasterquant` engine
//! - **driver**: Calibration sampling, activation capture and block-by-block
//!   quantization of a host model
//! - **config**: Declarative YAML configuration and the CLI
//! - **io**: Artifact saving and loading (JSON, YAML, SafeTensors)
//!
//! ## Example
//!
//! ```
//! use cuantizar::gptq::{FasterquantOptions, Gptq};
//! use cuantizar::quant::QuantizerConfig;
//! use ndarray::Array2;
//!
//! let x = Array2::from_shape_fn((16, 8), |(r, c)| ((r * 8 + c) as f64 * 0.3).sin());
//! let w = Array2::from_shape_fn((4, 8), |(r, c)| ((r + c) as f32 * 0.7).cos());
//!
//! let mut gptq = Gptq::new(8, QuantizerConfig::new(4).with_symmetric(false))?;
//! gptq.add_batch(x.view().into_dyn(), x.view().into_dyn())?;
//! let out = gptq.fasterquant(w.view().into_dyn(), &FasterquantOptions::default())?;
//! assert_eq!(out.qweight().shape(), &[4, 8]);
//! # Ok::<(), cuantizar::Error>(())
//! ```

pub mod config;
pub mod driver;
pub mod gptq;
pub mod io;
pub mod quant;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use gptq::{FasterquantOptions, Gptq, GptqOutput, GroupSize};
pub use quant::{Quantizer, QuantizerConfig};
