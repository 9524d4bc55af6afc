//! GPTQ engine
//!
//! One engine per linear layer. It accumulates the Hessian proxy from
//! calibration inputs, then quantizes the layer's weights column by column,
//! pushing each column's rounding error onto the columns not yet quantized.
//!
//! Lifecycle: `Fresh → Accumulating → Quantized → Freed`.

use super::hessian::{flatten_input, HessianAccumulator};
use super::linalg::inverse_cholesky_upper;
use super::output::GptqOutput;
use crate::quant::{dequantize, quantize, Quantizer, QuantizerConfig};
use crate::{Error, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewD, Axis};
use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Columns sharing one `(scale, zero)` pair
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum GroupSize {
    /// One pair per row (`-1` in configuration files)
    WholeRow,
    Columns(usize),
}

impl TryFrom<i64> for GroupSize {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            -1 => Ok(GroupSize::WholeRow),
            n if n >= 1 => Ok(GroupSize::Columns(n as usize)),
            n => Err(format!("group_size must be -1 or >= 1, got {n}")),
        }
    }
}

impl From<GroupSize> for i64 {
    fn from(value: GroupSize) -> Self {
        match value {
            GroupSize::WholeRow => -1,
            GroupSize::Columns(n) => n as i64,
        }
    }
}

impl fmt::Display for GroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupSize::WholeRow => write!(f, "row"),
            GroupSize::Columns(n) => write!(f, "{n}"),
        }
    }
}

/// Options for one `fasterquant` call
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FasterquantOptions {
    /// Columns per lazy-update block
    pub block_size: usize,
    /// Fraction of the mean Hessian diagonal added as damping
    pub damp_fraction: f64,
    pub group_size: GroupSize,
    /// Quantize columns in descending Hessian-diagonal order
    pub act_order: bool,
}

impl Default for FasterquantOptions {
    fn default() -> Self {
        Self {
            block_size: 128,
            damp_fraction: 0.01,
            group_size: GroupSize::WholeRow,
            act_order: false,
        }
    }
}

impl FasterquantOptions {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::ConfigError("block_size must be > 0".to_string()));
        }
        if !(self.damp_fraction.is_finite() && self.damp_fraction >= 0.0) {
            return Err(Error::ConfigError(format!(
                "damp_fraction {} must be finite and >= 0",
                self.damp_fraction
            )));
        }
        if self.group_size == GroupSize::Columns(0) {
            return Err(Error::ConfigError("group_size must be -1 or >= 1".to_string()));
        }
        Ok(())
    }
}

/// Engine lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Fresh,
    Accumulating,
    Quantized,
    Freed,
}

impl EngineState {
    pub fn name(&self) -> &'static str {
        match self {
            EngineState::Fresh => "fresh",
            EngineState::Accumulating => "accumulating",
            EngineState::Quantized => "quantized",
            EngineState::Freed => "freed",
        }
    }
}

/// GPTQ quantization engine for one layer
#[derive(Clone, Debug)]
pub struct Gptq {
    state: EngineState,
    columns: usize,
    hessian: Option<HessianAccumulator>,
    quantizer: Quantizer,
}

impl Gptq {
    /// Fresh engine for a layer with `columns` input channels
    pub fn new(columns: usize, config: QuantizerConfig) -> Result<Self> {
        Ok(Self {
            state: EngineState::Fresh,
            columns,
            hessian: Some(HessianAccumulator::new(columns)),
            quantizer: Quantizer::configure(config)?,
        })
    }

    /// Engine seeded with a precomputed Hessian representing `nsamples` rows
    pub fn with_hessian(h: Array2<f64>, nsamples: usize, config: QuantizerConfig) -> Result<Self> {
        let acc = HessianAccumulator::from_matrix(h, nsamples)?;
        Ok(Self {
            state: EngineState::Accumulating,
            columns: acc.columns(),
            hessian: Some(acc),
            quantizer: Quantizer::configure(config)?,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Calibration rows accumulated so far
    pub fn nsamples(&self) -> usize {
        self.hessian.as_ref().map_or(0, |h| h.nsamples())
    }

    pub fn hessian(&self) -> Option<&Array2<f64>> {
        self.hessian.as_ref().map(|h| h.matrix())
    }

    pub fn quantizer(&self) -> &Quantizer {
        &self.quantizer
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            state: self.state.name(),
        }
    }

    /// Fold one captured `(input, output)` pair into the Hessian.
    ///
    /// `output` is accepted for interface symmetry and not used.
    pub fn add_batch<A: Float>(&mut self, input: ArrayViewD<A>, _output: ArrayViewD<A>) -> Result<()> {
        if !matches!(self.state, EngineState::Fresh | EngineState::Accumulating) {
            return Err(self.invalid("add_batch"));
        }
        let x = flatten_input(input, self.columns)?;
        self.add_rows(x.view())
    }

    /// Fold an already flattened `[rows, columns]` batch into the Hessian
    pub fn add_rows(&mut self, x: ArrayView2<f64>) -> Result<()> {
        if !matches!(self.state, EngineState::Fresh | EngineState::Accumulating) {
            return Err(self.invalid("add_batch"));
        }
        if x.nrows() == 0 {
            return Ok(());
        }
        let acc = self
            .hessian
            .as_mut()
            .ok_or_else(|| Error::InvalidState {
                operation: "add_batch",
                state: "freed",
            })?;
        acc.add_batch(x)?;
        self.state = EngineState::Accumulating;
        Ok(())
    }

    /// Quantize `weight` (`[rows, …]`, flattened to `[rows, columns]`).
    ///
    /// The Hessian is released only on success, so a
    /// [`Error::NotPositiveDefinite`] failure can be retried with a larger
    /// `damp_fraction`.
    pub fn fasterquant<A: Float>(
        &mut self,
        weight: ArrayViewD<A>,
        options: &FasterquantOptions,
    ) -> Result<GptqOutput<A>> {
        if self.state != EngineState::Accumulating {
            return Err(self.invalid("fasterquant"));
        }
        options.validate()?;

        let shape = weight.shape().to_vec();
        if shape.len() < 2 {
            return Err(Error::ShapeMismatch {
                expected: vec![0, self.columns],
                got: shape,
            });
        }
        let rows = shape[0];
        let cols = shape[1..].iter().product::<usize>();
        if cols != self.columns {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, self.columns],
                got: shape,
            });
        }

        // Codes are stored in the weight type, which must hold 0..=maxq exactly
        let exact_limit = 2.0 / num_traits::cast::<A, f64>(A::epsilon()).unwrap_or(f64::INFINITY);
        let maxq = self.quantizer.maxq();
        if maxq.as_f64() > exact_limit {
            return Err(Error::InvalidParameter(format!(
                "{}-bit codes exceed the exact integer range of the weight type (up to {exact_limit})",
                self.quantizer.config().bits
            )));
        }

        let start = Instant::now();
        let data: Vec<f64> = weight
            .iter()
            .map(|&v| num_traits::cast::<A, f64>(v).unwrap_or(f64::NAN))
            .collect();
        let mut w = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| Error::InvalidParameter(format!("cannot flatten weight: {e}")))?;
        let mut h = self
            .hessian
            .as_ref()
            .map(|acc| acc.matrix().clone())
            .ok_or_else(|| self.invalid("fasterquant"))?;

        let (mut scale, mut zero) = match options.group_size {
            GroupSize::WholeRow => self.quantizer.find_weight_params(w.view())?,
            GroupSize::Columns(_) => (Array1::zeros(rows), Array1::zeros(rows)),
        };

        let mut dead = 0usize;
        for i in 0..cols {
            if h[[i, i]] == 0.0 {
                h[[i, i]] = 1.0;
                w.column_mut(i).fill(0.0);
                dead += 1;
            }
        }

        let perm = if options.act_order {
            let diag = h.diag().to_owned();
            let mut order: Vec<usize> = (0..cols).collect();
            order.sort_by(|&a, &b| diag[b].total_cmp(&diag[a]));
            w = w.select(Axis(1), &order);
            h = h.select(Axis(0), &order).select(Axis(1), &order);
            Some(order)
        } else {
            None
        };

        if cols > 0 {
            let damp = options.damp_fraction * h.diag().mean().unwrap_or(0.0);
            h.diag_mut().mapv_inplace(|d| d + damp);
        }
        let hinv = inverse_cholesky_upper(h.view())?;
        drop(h);

        let mut codes = Array2::<f64>::zeros((rows, cols));
        let mut group_scales: Vec<Array1<f64>> = Vec::new();
        let mut group_zeros: Vec<Array1<f64>> = Vec::new();
        let mut loss = 0.0;

        let mut i1 = 0;
        while i1 < cols {
            let i2 = (i1 + options.block_size).min(cols);
            let count = i2 - i1;
            let mut w1 = w.slice(s![.., i1..i2]).to_owned();
            let mut err1 = Array2::<f64>::zeros((rows, count));
            let hinv1 = hinv.slice(s![i1..i2, i1..i2]);

            for i in 0..count {
                let col = i1 + i;
                if let GroupSize::Columns(g) = options.group_size {
                    if col % g == 0 {
                        let end = (col + g).min(cols);
                        let (gs, gz) = self.quantizer.find_weight_params(w.slice(s![.., col..end]))?;
                        scale = gs.clone();
                        zero = gz.clone();
                        group_scales.push(gs);
                        group_zeros.push(gz);
                    }
                }

                let d = hinv1[[i, i]];
                for r in 0..rows {
                    let value = w1[[r, i]];
                    let code = quantize(value, scale[r], zero[r], maxq);
                    let residual = value - dequantize(code, scale[r], zero[r], maxq);
                    codes[[r, col]] = code;
                    loss += residual * residual / (d * d) / 2.0;
                    err1[[r, i]] = residual / d;
                }

                let err = err1.slice(s![.., i..i + 1]);
                let hrow = hinv1.slice(s![i..i + 1, i..]);
                let mut tail = w1.slice_mut(s![.., i..]);
                general_mat_mul(-1.0, &err, &hrow, 1.0, &mut tail);
            }

            if i2 < cols {
                let mut rest = w.slice_mut(s![.., i2..]);
                general_mat_mul(-1.0, &err1, &hinv.slice(s![i1..i2, i2..]), 1.0, &mut rest);
            }
            i1 = i2;
        }

        let perm = perm.map(Array1::from);
        if let Some(order) = &perm {
            let mut invperm = vec![0usize; cols];
            for (pos, &col) in order.iter().enumerate() {
                invperm[col] = pos;
            }
            codes = codes.select(Axis(1), &invperm);
        }

        let (scale, zero) = if group_scales.is_empty() {
            (
                scale.insert_axis(Axis(1)),
                zero.insert_axis(Axis(1)),
            )
        } else {
            let groups = group_scales.len();
            (
                Array2::from_shape_fn((rows, groups), |(r, g)| group_scales[g][r]),
                Array2::from_shape_fn((rows, groups), |(r, g)| group_zeros[g][r]),
            )
        };

        let output = GptqOutput::new(
            codes,
            &shape,
            scale,
            zero,
            perm,
            options.group_size,
            self.quantizer.config().symmetric,
            maxq,
            loss,
        )?;

        tracing::debug!(
            rows,
            columns = cols,
            dead_columns = dead,
            groups = output.num_groups(),
            loss,
            elapsed_ms = start.elapsed().as_secs_f64() * 1e3,
            "fasterquant complete"
        );

        self.hessian = None;
        self.state = EngineState::Quantized;
        Ok(output)
    }

    /// Release the Hessian and quantizer buffers
    pub fn free(&mut self) {
        self.hessian = None;
        self.quantizer.clear();
        self.state = EngineState::Freed;
    }

    /// Reuse this engine for a new layer
    pub fn reset(&mut self, columns: usize) {
        self.columns = columns;
        self.hessian = Some(HessianAccumulator::new(columns));
        self.quantizer.clear();
        self.state = EngineState::Fresh;
    }
}
