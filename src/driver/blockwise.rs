//! Sequential block-by-block quantization of a host model
//!
//! For each block: capture the inputs of every target sub-layer on the
//! current hidden states, quantize those sub-layers, write the dequantized
//! weights back, then replay the block to produce the next block's inputs.
//! Later blocks therefore calibrate against already quantized predecessors.

use super::block::{from_matrix, to_matrix, weight_columns, QuantBlock};
use super::calibration::{CalibrationSampler, CalibrationSet};
use super::capture::{LayerSink, PassThrough};
use super::report::{LayerArtifacts, QuantizationReport};
use crate::config::{validate_config, GptqConfig, LayerQuantConfig, LayerResolver};
use crate::gptq::{EngineState, Gptq, GptqOutput};
use crate::quant::{analyze_error, DequantRegistry, Element};
use crate::{Error, Result};
use ndarray::ArrayD;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One sub-layer awaiting quantization
struct LayerJob<A> {
    sub_layer: String,
    name: String,
    config: LayerQuantConfig,
    engine: Gptq,
    weight: ArrayD<A>,
}

impl<A: Element> LayerJob<A> {
    fn run(&mut self) -> Result<Option<GptqOutput<A>>> {
        if self.engine.state() == EngineState::Fresh {
            warn!(layer = %self.name, "no calibration rows reached layer, leaving it unquantized");
            return Ok(None);
        }
        let start = Instant::now();
        let output = self
            .engine
            .fasterquant(self.weight.view(), &self.config.fasterquant_options())?;
        debug!(
            layer = %self.name,
            loss = output.loss(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "quantized layer"
        );
        Ok(Some(output))
    }
}

/// Drives GPTQ over every block of a host model
#[derive(Debug, Clone)]
pub struct BlockwiseQuantizer {
    config: GptqConfig,
    resolver: LayerResolver,
    registry: DequantRegistry,
}

impl BlockwiseQuantizer {
    /// Validates `config` and compiles its layer patterns
    pub fn new(config: GptqConfig) -> Result<Self> {
        validate_config(&config).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;
        let resolver = LayerResolver::new(&config)?;
        Ok(Self {
            config,
            resolver,
            registry: DequantRegistry::with_defaults(),
        })
    }

    /// Replace the dequantization strategies used for write-back
    pub fn with_registry(mut self, registry: DequantRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &GptqConfig {
        &self.config
    }

    pub fn registry(&self) -> &DequantRegistry {
        &self.registry
    }

    /// Sample selector configured from the calibration section
    pub fn sampler(&self) -> CalibrationSampler {
        CalibrationSampler::new(self.config.calibration.clone())
    }

    /// Full name of a sub-layer, `"{prefix}.{block}.{sub_layer}"`
    pub fn layer_name(&self, block: usize, sub_layer: &str) -> String {
        format!("{}.{}.{}", self.config.prefix, block, sub_layer)
    }

    /// Quantize `blocks` in order, feeding `calibration` into the first one.
    ///
    /// Quantized weights are written back through [`QuantBlock::set_weight`]
    /// before the block's outputs are computed for the next block.
    pub fn run<B: QuantBlock>(
        &self,
        blocks: &mut [B],
        calibration: &CalibrationSet,
    ) -> Result<QuantizationReport> {
        let mut report = QuantizationReport::default();
        let mut hidden: Vec<ArrayD<f64>> = calibration.samples().to_vec();
        let total = blocks.len();
        let precision = B::Elem::PRECISION;

        info!(
            blocks = total,
            samples = hidden.len(),
            precision = precision.name(),
            "starting quantization"
        );

        for (index, block) in blocks.iter_mut().enumerate() {
            let start = Instant::now();

            let mut targets = Vec::new();
            for sub_layer in block.sub_layers() {
                let name = self.layer_name(index, &sub_layer);
                match self.resolver.resolve(&name) {
                    Some(config) => targets.push((sub_layer, name, config)),
                    None => {
                        warn!(layer = %name, "layer is excluded, keeping full precision");
                        report.skipped.push(name);
                    }
                }
            }

            let mut engines = BTreeMap::new();
            for (sub_layer, _, config) in &targets {
                let columns = weight_columns(block.weight(sub_layer)?.shape())?;
                engines.insert(sub_layer.clone(), Gptq::new(columns, config.quantizer_config())?);
            }

            if !targets.is_empty() {
                let stop_after = targets.last().map(|(sub_layer, _, _)| sub_layer.clone());
                let mut sink = LayerSink::new(engines, stop_after);
                for h in &hidden {
                    block.forward(h.view(), &mut sink)?;
                }
                engines = sink.into_engines();
            }

            let mut jobs = targets
                .into_iter()
                .map(|(sub_layer, name, config)| {
                    let engine = engines
                        .remove(&sub_layer)
                        .ok_or_else(|| Error::UnknownLayer(name.clone()))?;
                    let weight = block.weight(&sub_layer)?.to_owned();
                    Ok(LayerJob {
                        sub_layer,
                        name,
                        config,
                        engine,
                        weight,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            // Every sub-layer must succeed before the host is touched
            let outputs = if self.config.parallel_sublayers {
                jobs.par_iter_mut().map(LayerJob::run).collect::<Result<Vec<_>>>()?
            } else {
                jobs.iter_mut().map(LayerJob::run).collect::<Result<Vec<_>>>()?
            };

            let mut updates = Vec::with_capacity(jobs.len());
            for (job, output) in jobs.iter().zip(outputs) {
                let Some(output) = output else {
                    report.skipped.push(job.name.clone());
                    continue;
                };
                let original = to_matrix(job.weight.view())?;
                let dequantized = output.dequantize_with(&self.registry, precision)?;
                // Anything beyond half a quantization step was moved by error compensation
                let half_step = output.scale().iter().fold(0.0f64, |m, s| m.max(s.abs())) / 2.0;
                let weight_error = analyze_error(original.view(), dequantized.view(), half_step)?;
                let weight = from_matrix::<B::Elem>(&dequantized, job.weight.shape())?;
                let artifacts = LayerArtifacts::from_output(&output, job.config.bits, weight_error);
                updates.push((job.sub_layer.clone(), job.name.clone(), weight, artifacts));
            }

            let quantized = updates.len();
            for (sub_layer, name, weight, artifacts) in updates {
                block.set_weight(&sub_layer, weight)?;
                report.layers.insert(name, artifacts);
            }
            for job in &mut jobs {
                job.engine.free();
            }

            hidden = hidden
                .iter()
                .map(|h| block.forward(h.view(), &mut PassThrough)?.into_hidden())
                .collect::<Result<Vec<_>>>()?;

            info!(
                block = index + 1,
                total,
                layers = quantized,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "quantized block"
            );
        }

        info!(
            layers = report.layers.len(),
            skipped = report.skipped.len(),
            total_loss = report.total_loss(),
            "quantization finished"
        );
        Ok(report)
    }
}
