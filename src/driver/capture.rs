//! Capture of sub-layer activations during a block forward pass
//!
//! The host calls [`CaptureSink::capture`] for every target sub-layer it runs.
//! A sink that has seen everything it needs answers
//! [`CaptureControl::Stop`]; the host then returns
//! [`ForwardOutcome::Stopped`] without computing the rest of the block.

use crate::gptq::Gptq;
use crate::{Error, Result};
use ndarray::{ArrayD, ArrayViewD};
use std::collections::BTreeMap;

/// Whether the forward pass should keep going
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureControl {
    Continue,
    Stop,
}

/// Receives `(input, output)` activations of named sub-layers
pub trait CaptureSink {
    fn capture(
        &mut self,
        layer: &str,
        input: ArrayViewD<'_, f64>,
        output: ArrayViewD<'_, f64>,
    ) -> Result<CaptureControl>;
}

/// Result of a block forward pass
#[derive(Clone, Debug, PartialEq)]
pub enum ForwardOutcome {
    /// Block output hidden states
    Completed(ArrayD<f64>),
    /// A sink asked to stop early
    Stopped,
}

impl ForwardOutcome {
    pub fn into_hidden(self) -> Result<ArrayD<f64>> {
        match self {
            ForwardOutcome::Completed(hidden) => Ok(hidden),
            ForwardOutcome::Stopped => Err(Error::InvalidState {
                operation: "propagate hidden states",
                state: "stopped",
            }),
        }
    }
}

/// Sink that records nothing and never stops
#[derive(Clone, Copy, Debug, Default)]
pub struct PassThrough;

impl CaptureSink for PassThrough {
    fn capture(
        &mut self,
        _layer: &str,
        _input: ArrayViewD<'_, f64>,
        _output: ArrayViewD<'_, f64>,
    ) -> Result<CaptureControl> {
        Ok(CaptureControl::Continue)
    }
}

/// Routes captured batches into per-layer GPTQ engines.
///
/// Layers without an engine are ignored. Once the last layer in forward order
/// has been captured the sink stops the pass.
#[derive(Debug)]
pub struct LayerSink {
    engines: BTreeMap<String, Gptq>,
    stop_after: Option<String>,
    captured: usize,
}

impl LayerSink {
    /// `stop_after` names the last engine layer in forward order
    pub fn new(engines: BTreeMap<String, Gptq>, stop_after: Option<String>) -> Self {
        Self {
            engines,
            stop_after,
            captured: 0,
        }
    }

    /// Number of batches routed into engines
    pub fn captured(&self) -> usize {
        self.captured
    }

    pub fn engine(&self, layer: &str) -> Option<&Gptq> {
        self.engines.get(layer)
    }

    pub fn into_engines(self) -> BTreeMap<String, Gptq> {
        self.engines
    }
}

impl CaptureSink for LayerSink {
    fn capture(
        &mut self,
        layer: &str,
        input: ArrayViewD<'_, f64>,
        output: ArrayViewD<'_, f64>,
    ) -> Result<CaptureControl> {
        if let Some(engine) = self.engines.get_mut(layer) {
            engine.add_batch(input, output)?;
            self.captured += 1;
        }
        if self.stop_after.as_deref() == Some(layer) {
            Ok(CaptureControl::Stop)
        } else {
            Ok(CaptureControl::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gptq::EngineState;
    use crate::quant::QuantizerConfig;
    use ndarray::Array2;

    #[test]
    fn test_layer_sink_routes_and_stops() {
        let mut engines = BTreeMap::new();
        engines.insert("a".to_string(), Gptq::new(3, QuantizerConfig::new(4)).unwrap());
        engines.insert("b".to_string(), Gptq::new(2, QuantizerConfig::new(4)).unwrap());
        let mut sink = LayerSink::new(engines, Some("b".to_string()));

        let xa = Array2::<f64>::ones((4, 3));
        let xb = Array2::<f64>::ones((4, 2));
        assert_eq!(
            sink.capture("a", xa.view().into_dyn(), xa.view().into_dyn()).unwrap(),
            CaptureControl::Continue
        );
        assert_eq!(
            sink.capture("ignored", xa.view().into_dyn(), xa.view().into_dyn()).unwrap(),
            CaptureControl::Continue
        );
        assert_eq!(
            sink.capture("b", xb.view().into_dyn(), xb.view().into_dyn()).unwrap(),
            CaptureControl::Stop
        );

        assert_eq!(sink.captured(), 2);
        assert_eq!(sink.engine("a").unwrap().state(), EngineState::Accumulating);
        assert_eq!(sink.engine("a").unwrap().nsamples(), 4);
    }

    #[test]
    fn test_layer_sink_propagates_shape_errors() {
        let mut engines = BTreeMap::new();
        engines.insert("a".to_string(), Gptq::new(3, QuantizerConfig::new(4)).unwrap());
        let mut sink = LayerSink::new(engines, None);
        let x = Array2::<f64>::ones((4, 5));
        assert!(sink.capture("a", x.view().into_dyn(), x.view().into_dyn()).is_err());
    }

    #[test]
    fn test_stopped_outcome_has_no_hidden_state() {
        assert!(ForwardOutcome::Stopped.into_hidden().is_err());
    }
}
