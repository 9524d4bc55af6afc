//! Quantization results per layer

use super::calibration::CalibrationReport;
use crate::gptq::{GptqOutput, GroupSize};
use crate::quant::{
    DequantRegistry, Maxq, PackedLayer, Precision, QuantErrorStats, QuantMode, StrategyKey, Topology,
};
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Packed representation of one quantized layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerArtifacts {
    /// Original weight shape
    pub shape: Vec<usize>,
    pub bits: u8,
    pub maxq: Maxq,
    pub group_size: GroupSize,
    pub symmetric: bool,
    /// Integer codes `[rows, columns]`, original column order
    pub qweight: Array2<u32>,
    /// `[rows, groups]`
    pub scale: Array2<f64>,
    /// `[rows, groups]`, omitted for symmetric affine layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero: Option<Array2<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perm: Option<Array1<usize>>,
    pub g_idx: Array1<usize>,
    pub loss: f64,
    #[serde(default)]
    pub weight_error: QuantErrorStats,
}

impl LayerArtifacts {
    pub fn from_output<A>(output: &GptqOutput<A>, bits: u8, weight_error: QuantErrorStats) -> Self {
        Self {
            shape: output.qweight().shape().to_vec(),
            bits,
            maxq: output.maxq(),
            group_size: output.group_size(),
            symmetric: output.symmetric(),
            qweight: output.codes().mapv(|q| q as u32),
            scale: output.scale().clone(),
            zero: output.zero().cloned(),
            perm: output.perm().cloned(),
            g_idx: output.g_idx(),
            loss: output.loss(),
            weight_error,
        }
    }

    pub fn act_order(&self) -> bool {
        self.perm.is_some()
    }

    pub fn topology(&self) -> Topology {
        Topology::from_layout(matches!(self.group_size, GroupSize::Columns(_)), self.act_order())
    }

    pub fn strategy_key(&self, precision: Precision) -> StrategyKey {
        StrategyKey::new(precision, self.topology(), QuantMode::from_flags(self.symmetric, self.maxq))
    }

    /// Zero points, with the implied midpoint filled in for symmetric layers
    pub fn zero_points(&self) -> Array2<f64> {
        match &self.zero {
            Some(zero) => zero.clone(),
            None => Array2::from_elem(self.scale.dim(), self.maxq.symmetric_zero()),
        }
    }

    /// Reconstructed `[rows, columns]` weights
    pub fn dequantize(&self, registry: &DequantRegistry, precision: Precision) -> Result<Array2<f64>> {
        if self.zero.is_none() && (!self.symmetric || self.maxq.is_ternary()) {
            return Err(Error::InvalidParameter(
                "layer is missing zero points".to_string(),
            ));
        }
        let strategy = registry.resolve(&self.strategy_key(precision))?;
        let codes = self.qweight.mapv(f64::from);
        let zero = self.zero_points();
        let layer = PackedLayer {
            codes: codes.view(),
            scale: self.scale.view(),
            zero: zero.view(),
            g_idx: self.g_idx.view(),
            group_size: match self.group_size {
                GroupSize::WholeRow => None,
                GroupSize::Columns(g) => Some(g),
            },
            maxq: self.maxq,
        };
        strategy.dequantize(&layer, precision)
    }
}

/// Everything produced by one quantization run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantizationReport {
    /// Keyed by full layer name
    pub layers: BTreeMap<String, LayerArtifacts>,
    /// Layers left in full precision (excluded or never reached)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationReport>,
}

impl QuantizationReport {
    pub fn total_loss(&self) -> f64 {
        self.layers.values().map(|l| l.loss).sum()
    }

    pub fn get(&self, layer: &str) -> Result<&LayerArtifacts> {
        self.layers
            .get(layer)
            .ok_or_else(|| Error::UnknownLayer(layer.to_string()))
    }
}
