//! Streaming Hessian proxy `H = 2·XᵀX / N`
//!
//! Batches arrive one at a time; the running mean is kept exact by rescaling
//! before each update, so the result does not depend on how the calibration
//! rows were chunked.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2, ArrayViewD};
use num_traits::Float;

/// Flatten an activation tensor to `[rows, columns]` in `f64`.
///
/// Rank 1 is a single row; higher ranks fold every leading axis into rows.
pub fn flatten_input<A: Float>(input: ArrayViewD<A>, columns: usize) -> Result<Array2<f64>> {
    let shape = input.shape();
    let last = shape.last().copied().unwrap_or(0);
    if shape.is_empty() || last != columns {
        return Err(Error::ShapeMismatch {
            expected: vec![columns],
            got: shape.to_vec(),
        });
    }
    let rows = if columns == 0 { 0 } else { input.len() / columns };
    let data: Vec<f64> = input
        .iter()
        .map(|&v| num_traits::cast::<A, f64>(v).unwrap_or(f64::NAN))
        .collect();
    Array2::from_shape_vec((rows, columns), data)
        .map_err(|e| Error::InvalidParameter(format!("cannot flatten input {shape:?}: {e}")))
}

/// Running `2·XᵀX / N` over every calibration row seen
#[derive(Clone, Debug)]
pub struct HessianAccumulator {
    h: Array2<f64>,
    nsamples: usize,
}

impl HessianAccumulator {
    pub fn new(columns: usize) -> Self {
        Self {
            h: Array2::zeros((columns, columns)),
            nsamples: 0,
        }
    }

    /// Start from an existing matrix representing `nsamples` rows
    pub fn from_matrix(h: Array2<f64>, nsamples: usize) -> Result<Self> {
        if h.nrows() != h.ncols() {
            return Err(Error::ShapeMismatch {
                expected: vec![h.nrows(), h.nrows()],
                got: h.shape().to_vec(),
            });
        }
        Ok(Self { h, nsamples })
    }

    pub fn columns(&self) -> usize {
        self.h.ncols()
    }

    /// Number of rows accumulated so far
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.h
    }

    pub fn into_matrix(self) -> Array2<f64> {
        self.h
    }

    /// Fold a `[m, columns]` batch into the estimate. Empty batches are ignored.
    pub fn add_batch(&mut self, x: ArrayView2<f64>) -> Result<()> {
        if x.ncols() != self.columns() {
            return Err(Error::ShapeMismatch {
                expected: vec![x.nrows(), self.columns()],
                got: x.shape().to_vec(),
            });
        }
        let m = x.nrows();
        if m == 0 {
            return Ok(());
        }

        let n = self.nsamples as f64;
        let total = n + m as f64;
        self.h *= n / total;
        self.nsamples += m;

        let scaled = &x * (2.0 / total).sqrt();
        self.h += &scaled.t().dot(&scaled);
        Ok(())
    }
}
