//! YAML schema definitions for declarative quantization configuration

use crate::gptq::{FasterquantOptions, GroupSize};
use crate::quant::QuantizerConfig;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Complete quantization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptqConfig {
    /// Settings applied to every layer without an override
    #[serde(default)]
    pub defaults: LayerQuantConfig,

    /// Per-layer overrides keyed by exact name or regex, in declaration order
    #[serde(default, with = "ordered_overrides", skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<(String, LayerOverride)>,

    /// Layer name patterns left in full precision
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    /// Calibration sample selection
    #[serde(default)]
    pub calibration: CalibrationConfig,

    /// Quantize the sub-layers of one block concurrently
    #[serde(default)]
    pub parallel_sublayers: bool,

    /// Prefix of full layer names, `"{prefix}.{block}.{sub_layer}"`
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for GptqConfig {
    fn default() -> Self {
        Self {
            defaults: LayerQuantConfig::default(),
            layers: Vec::new(),
            exclude: Vec::new(),
            calibration: CalibrationConfig::default(),
            parallel_sublayers: false,
            prefix: default_prefix(),
        }
    }
}

/// Fully resolved settings for one layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerQuantConfig {
    pub bits: u8,
    /// Columns per `(scale, zero)` pair; `-1` for whole rows
    pub group_size: GroupSize,
    pub block_size: usize,
    pub damp_fraction: f64,
    pub symmetric: bool,
    pub act_order: bool,
    pub per_channel: bool,
    pub use_mse_search: bool,
    pub norm: f64,
    pub grid: usize,
    pub max_shrink: f64,
    pub trits: bool,
}

impl Default for LayerQuantConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            group_size: GroupSize::Columns(128),
            block_size: 128,
            damp_fraction: 0.01,
            symmetric: false,
            act_order: false,
            per_channel: true,
            use_mse_search: false,
            norm: 2.4,
            grid: 100,
            max_shrink: 0.8,
            trits: false,
        }
    }
}

impl LayerQuantConfig {
    pub fn quantizer_config(&self) -> QuantizerConfig {
        QuantizerConfig {
            bits: self.bits,
            per_channel: self.per_channel,
            symmetric: self.symmetric,
            use_mse_search: self.use_mse_search,
            norm: self.norm,
            grid: self.grid,
            max_shrink: self.max_shrink,
            trits: self.trits,
        }
    }

    pub fn fasterquant_options(&self) -> FasterquantOptions {
        FasterquantOptions {
            block_size: self.block_size,
            damp_fraction: self.damp_fraction,
            group_size: self.group_size,
            act_order: self.act_order,
        }
    }
}

/// Partial settings layered over [`GptqConfig::defaults`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_size: Option<GroupSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damp_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symmetric: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act_order: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_channel: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_mse_search: Option<bool>,
}

impl LayerOverride {
    pub fn apply(&self, base: &LayerQuantConfig) -> LayerQuantConfig {
        LayerQuantConfig {
            bits: self.bits.unwrap_or(base.bits),
            group_size: self.group_size.unwrap_or(base.group_size),
            block_size: self.block_size.unwrap_or(base.block_size),
            damp_fraction: self.damp_fraction.unwrap_or(base.damp_fraction),
            symmetric: self.symmetric.unwrap_or(base.symmetric),
            act_order: self.act_order.unwrap_or(base.act_order),
            per_channel: self.per_channel.unwrap_or(base.per_channel),
            use_mse_search: self.use_mse_search.unwrap_or(base.use_mse_search),
            ..*base
        }
    }
}

/// Calibration sample selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Number of samples to collect
    pub nsamples: usize,
    /// Sequence length; longer samples are cropped to a random window
    pub pad_max_length: usize,
    /// Skip samples shorter than `pad_max_length`
    pub use_max_length: bool,
    /// Seed for the crop window
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            nsamples: 128,
            pad_max_length: 2048,
            use_max_length: true,
            seed: 0,
        }
    }
}

fn default_prefix() -> String {
    "layers".to_string()
}

/// YAML map <-> ordered `Vec` of overrides
mod ordered_overrides {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &[(String, LayerOverride)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(value.len()))?;
        for (k, v) in value {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, LayerOverride)>, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Vec<(String, LayerOverride)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of layer name or pattern to overrides")
            }

            fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<Self::Value, M::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((k, v)) = access.next_entry::<String, LayerOverride>()? {
                    entries.push((k, v));
                }
                Ok(entries)
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}
