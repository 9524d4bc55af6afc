//! Model-level driver: calibration, activation capture and block-by-block
//! quantization of a host model.
//!
//! The host implements [`QuantBlock`] for its blocks; [`BlockwiseQuantizer`]
//! walks them in order and returns a [`QuantizationReport`].

mod block;
mod blockwise;
mod calibration;
mod capture;
mod report;

pub use block::{from_matrix, to_matrix, weight_columns, LinearChain, LinearLayer, QuantBlock};
pub use blockwise::BlockwiseQuantizer;
pub use calibration::{CalibrationReport, CalibrationSampler, CalibrationSet};
pub use capture::{CaptureControl, CaptureSink, ForwardOutcome, LayerSink, PassThrough};
pub use report::{LayerArtifacts, QuantizationReport};
