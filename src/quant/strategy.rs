//! Dequantization strategy registry
//!
//! Packed layers are dequantized by one of a small set of kernels. Which one
//! applies depends on the host precision, the group topology and the zero
//! point mode. The registry maps each `(Precision, Topology, QuantMode)` key to
//! a [`DequantStrategy`] by direct lookup; a key that was never registered is
//! an error.

use super::primitive::{dequantize, Maxq};
use crate::{Error, Result};
use half::{bf16, f16};
use ndarray::{Array2, ArrayView1, ArrayView2};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Element precision of the host weights
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    F16,
    BF16,
    F32,
    F64,
}

impl Precision {
    /// Round a working value to this precision
    pub fn round(&self, v: f64) -> f64 {
        match self {
            Precision::F16 => f16::from_f64(v).to_f64(),
            Precision::BF16 => bf16::from_f64(v).to_f64(),
            Precision::F32 => v as f32 as f64,
            Precision::F64 => v,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Precision::F16 => "f16",
            Precision::BF16 => "bf16",
            Precision::F32 => "f32",
            Precision::F64 => "f64",
        }
    }
}

/// Host element types with a known precision tag
pub trait Element: Float + Send + Sync + 'static {
    const PRECISION: Precision;
}

impl Element for f16 {
    const PRECISION: Precision = Precision::F16;
}

impl Element for bf16 {
    const PRECISION: Precision = Precision::BF16;
}

impl Element for f32 {
    const PRECISION: Precision = Precision::F32;
}

impl Element for f64 {
    const PRECISION: Precision = Precision::F64;
}

/// How input channels map onto parameter groups
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    /// One `(scale, zero)` per row
    PerRow,
    /// Contiguous column groups
    Grouped,
    /// Groups defined in activation-order (permuted) index space
    GroupedActOrder,
}

impl Topology {
    pub fn from_layout(grouped: bool, act_order: bool) -> Self {
        match (grouped, act_order) {
            (false, _) => Topology::PerRow,
            (true, false) => Topology::Grouped,
            (true, true) => Topology::GroupedActOrder,
        }
    }

    /// Whether column `c` always belongs to group `c / group_size`.
    ///
    /// False for grouped act-order layers: consumers must gather through
    /// `g_idx` instead of striding.
    pub fn fusable(&self) -> bool {
        !matches!(self, Topology::GroupedActOrder)
    }
}

/// Zero point mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantMode {
    Symmetric,
    Asymmetric,
    Ternary,
}

impl QuantMode {
    pub fn from_flags(symmetric: bool, maxq: Maxq) -> Self {
        match (maxq, symmetric) {
            (Maxq::Ternary, _) => QuantMode::Ternary,
            (_, true) => QuantMode::Symmetric,
            (_, false) => QuantMode::Asymmetric,
        }
    }
}

/// Registry lookup key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyKey {
    pub precision: Precision,
    pub topology: Topology,
    pub mode: QuantMode,
}

impl StrategyKey {
    pub fn new(precision: Precision, topology: Topology, mode: QuantMode) -> Self {
        Self {
            precision,
            topology,
            mode,
        }
    }
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:?}/{:?}", self.precision.name(), self.topology, self.mode)
    }
}

/// Packed layer borrowed for dequantization
#[derive(Clone, Copy, Debug)]
pub struct PackedLayer<'a> {
    /// Integer codes `[rows, columns]`, original column order
    pub codes: ArrayView2<'a, f64>,
    /// `[rows, groups]`
    pub scale: ArrayView2<'a, f64>,
    /// `[rows, groups]`
    pub zero: ArrayView2<'a, f64>,
    /// Group index per original column
    pub g_idx: ArrayView1<'a, usize>,
    /// Columns per group, `None` for whole-row
    pub group_size: Option<usize>,
    pub maxq: Maxq,
}

/// Concrete dequantization kernels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DequantStrategy {
    /// Single parameter column
    RowWise,
    /// Group of column `c` is `c / group_size`
    Strided,
    /// Group of column `c` is `g_idx[c]`
    Gather,
}

impl DequantStrategy {
    /// Reconstruct real-valued weights, rounded to `precision`
    pub fn dequantize(&self, layer: &PackedLayer<'_>, precision: Precision) -> Result<Array2<f64>> {
        let (rows, cols) = layer.codes.dim();
        let groups = layer.scale.ncols();
        if layer.scale.nrows() != rows || layer.zero.dim() != layer.scale.dim() {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, groups],
                got: layer.zero.shape().to_vec(),
            });
        }
        if layer.g_idx.len() != cols {
            return Err(Error::ShapeMismatch {
                expected: vec![cols],
                got: vec![layer.g_idx.len()],
            });
        }

        let group_of = |c: usize| -> usize {
            match self {
                DequantStrategy::RowWise => 0,
                DequantStrategy::Strided => layer.group_size.map_or(0, |g| c / g),
                DequantStrategy::Gather => layer.g_idx[c],
            }
        };

        let mut out = Array2::zeros((rows, cols));
        for c in 0..cols {
            let g = group_of(c);
            if g >= groups {
                return Err(Error::InvalidParameter(format!(
                    "column {c} maps to group {g}, layer has {groups}"
                )));
            }
            for r in 0..rows {
                let v = dequantize(layer.codes[[r, c]], layer.scale[[r, g]], layer.zero[[r, g]], layer.maxq);
                out[[r, c]] = precision.round(v);
            }
        }
        Ok(out)
    }
}

/// Table of dequantization strategies
#[derive(Clone, Debug, Default)]
pub struct DequantRegistry {
    table: HashMap<StrategyKey, DequantStrategy>,
}

impl DequantRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every supported combination
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let precisions = [Precision::F16, Precision::BF16, Precision::F32, Precision::F64];
        let modes = [QuantMode::Symmetric, QuantMode::Asymmetric, QuantMode::Ternary];
        for &precision in &precisions {
            for &mode in &modes {
                registry.register(StrategyKey::new(precision, Topology::PerRow, mode), DequantStrategy::RowWise);
                registry.register(StrategyKey::new(precision, Topology::Grouped, mode), DequantStrategy::Strided);
                registry.register(
                    StrategyKey::new(precision, Topology::GroupedActOrder, mode),
                    DequantStrategy::Gather,
                );
            }
        }
        registry
    }

    /// Insert or replace a strategy; returns the previous one
    pub fn register(&mut self, key: StrategyKey, strategy: DequantStrategy) -> Option<DequantStrategy> {
        if !key.topology.fusable() && strategy == DequantStrategy::Strided {
            tracing::warn!(%key, "registering a strided strategy for a non-fusable topology");
        }
        self.table.insert(key, strategy)
    }

    pub fn resolve(&self, key: &StrategyKey) -> Result<DequantStrategy> {
        self.table
            .get(key)
            .copied()
            .ok_or_else(|| Error::MissingStrategy(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
