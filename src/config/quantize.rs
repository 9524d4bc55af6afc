//! Single-command quantization from files

use super::cli::{apply_overrides, QuantizeArgs};
use super::load::load_config;
use super::schema::GptqConfig;
use crate::driver::{BlockwiseQuantizer, LinearChain, QuantizationReport};
use crate::error::Result;
use crate::io::{load_tensors, save_artifacts, SaveConfig};

/// Quantize a chain of linear layers described by command-line arguments
///
/// This is the entry point behind `cuantizar quantize`. It:
/// 1. Loads the YAML config (or the defaults) and applies overrides
/// 2. Builds a [`LinearChain`] from the weights file
/// 3. Selects calibration samples
/// 4. Quantizes block by block
/// 5. Saves the artifacts, format chosen by the output extension
///
/// # Example
///
/// ```no_run
/// use clap::Parser;
/// use cuantizar::config::{quantize_from_args, QuantizeArgs};
///
/// let args = QuantizeArgs::parse_from([
///     "quantize", "weights.safetensors", "-c", "calib.safetensors", "-o", "out.safetensors",
/// ]);
/// let report = quantize_from_args(&args)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn quantize_from_args(args: &QuantizeArgs) -> Result<QuantizationReport> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GptqConfig::default(),
    };
    apply_overrides(&mut config, args);
    let quantizer = BlockwiseQuantizer::new(config)?;

    let weights = load_tensors(&args.weights)?;
    let mut model = LinearChain::from_named(weights, &quantizer.config().prefix)?;

    let samples = load_tensors(&args.calibration)?
        .into_iter()
        .map(|(_, sample)| sample.mapv(f64::from));
    let (calibration, calibration_report) = quantizer.sampler().select(samples);

    let mut report = quantizer.run(model.blocks_mut(), &calibration)?;
    report.calibration = Some(calibration_report);

    save_artifacts(&report, &args.output, &SaveConfig::for_path(&args.output))?;
    Ok(report)
}
