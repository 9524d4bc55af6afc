//! Result of quantizing one layer

use super::engine::GroupSize;
use crate::quant::{
    DequantRegistry, DequantStrategy, Maxq, PackedLayer, Precision, QuantMode, StrategyKey, Topology,
};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use num_traits::Float;

/// Quantized codes plus everything needed to reconstruct the weights.
///
/// Codes keep the weight's element type and shape. `scale`/`zero` are
/// `[rows, groups]` with groups in processing order, which differs from
/// column order when activation ordering is on; [`GptqOutput::g_idx`] gives
/// the mapping.
#[derive(Clone, Debug)]
pub struct GptqOutput<A> {
    qweight: ArrayD<A>,
    codes: Array2<f64>,
    scale: Array2<f64>,
    zero: Array2<f64>,
    perm: Option<Array1<usize>>,
    group_size: GroupSize,
    symmetric: bool,
    maxq: Maxq,
    loss: f64,
}

impl<A: Float> GptqOutput<A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        codes: Array2<f64>,
        shape: &[usize],
        scale: Array2<f64>,
        zero: Array2<f64>,
        perm: Option<Array1<usize>>,
        group_size: GroupSize,
        symmetric: bool,
        maxq: Maxq,
        loss: f64,
    ) -> Result<Self> {
        let data = codes
            .iter()
            .map(|&v| {
                num_traits::cast::<f64, A>(v)
                    .filter(|&a| num_traits::cast::<A, f64>(a) == Some(v))
                    .ok_or_else(|| {
                        Error::InvalidParameter(format!(
                            "code {v} is not exactly representable in the weight type"
                        ))
                    })
            })
            .collect::<Result<Vec<A>>>()?;
        let qweight = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|e| {
            Error::InvalidParameter(format!("cannot restore weight shape {shape:?}: {e}"))
        })?;

        Ok(Self {
            qweight,
            codes,
            scale,
            zero,
            perm,
            group_size,
            symmetric,
            maxq,
            loss,
        })
    }
}

impl<A> GptqOutput<A> {
    /// Integer codes in `[0, maxq]`, original shape and element type
    pub fn qweight(&self) -> &ArrayD<A> {
        &self.qweight
    }

    /// Codes flattened to `[rows, columns]`
    pub fn codes(&self) -> &Array2<f64> {
        &self.codes
    }

    pub fn scale(&self) -> &Array2<f64> {
        &self.scale
    }

    /// Zero points, omitted for symmetric affine quantization. Ternary
    /// layers always keep theirs since they hold the fitted minimum.
    pub fn zero(&self) -> Option<&Array2<f64>> {
        if self.symmetric && !self.maxq.is_ternary() {
            None
        } else {
            Some(&self.zero)
        }
    }

    /// Zero points including the implied symmetric midpoint
    pub fn zero_points(&self) -> &Array2<f64> {
        &self.zero
    }

    /// Processing order of input channels, present with activation ordering
    pub fn perm(&self) -> Option<&Array1<usize>> {
        self.perm.as_ref()
    }

    /// Inverse of [`GptqOutput::perm`]
    pub fn invperm(&self) -> Option<Array1<usize>> {
        self.perm.as_ref().map(|perm| {
            let mut inv = Array1::zeros(perm.len());
            for (pos, &col) in perm.iter().enumerate() {
                inv[col] = pos;
            }
            inv
        })
    }

    pub fn group_size(&self) -> GroupSize {
        self.group_size
    }

    pub fn symmetric(&self) -> bool {
        self.symmetric
    }

    pub fn maxq(&self) -> Maxq {
        self.maxq
    }

    /// Accumulated `Σ (w − q)² / (2·d²)` over the layer
    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn rows(&self) -> usize {
        self.codes.nrows()
    }

    pub fn columns(&self) -> usize {
        self.codes.ncols()
    }

    pub fn num_groups(&self) -> usize {
        self.scale.ncols()
    }

    /// Group index of every input channel, in original channel order
    pub fn g_idx(&self) -> Array1<usize> {
        let cols = self.columns();
        match self.group_size {
            GroupSize::WholeRow => Array1::zeros(cols),
            GroupSize::Columns(g) => match self.invperm() {
                Some(inv) => inv.mapv(|p| p / g),
                None => Array1::from_shape_fn(cols, |j| j / g),
            },
        }
    }

    pub fn topology(&self) -> Topology {
        Topology::from_layout(
            matches!(self.group_size, GroupSize::Columns(_)),
            self.perm.is_some(),
        )
    }

    pub fn strategy_key(&self, precision: Precision) -> StrategyKey {
        StrategyKey::new(precision, self.topology(), QuantMode::from_flags(self.symmetric, self.maxq))
    }

    /// Reconstructed `[rows, columns]` weights in `f64`, original column order
    pub fn dequantize(&self) -> Result<Array2<f64>> {
        let g_idx = self.g_idx();
        DequantStrategy::Gather.dequantize(&self.packed(&g_idx), Precision::F64)
    }

    /// Reconstruct through the strategy registered for this layer's layout
    pub fn dequantize_with(&self, registry: &DequantRegistry, precision: Precision) -> Result<Array2<f64>> {
        let strategy = registry.resolve(&self.strategy_key(precision))?;
        let g_idx = self.g_idx();
        strategy.dequantize(&self.packed(&g_idx), precision)
    }

    fn packed<'a>(&'a self, g_idx: &'a Array1<usize>) -> PackedLayer<'a> {
        PackedLayer {
            codes: self.codes.view(),
            scale: self.scale.view(),
            zero: self.zero.view(),
            g_idx: g_idx.view(),
            group_size: match self.group_size {
                GroupSize::WholeRow => None,
                GroupSize::Columns(g) => Some(g),
            },
            maxq: self.maxq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn grouped_act_order() -> GptqOutput<f32> {
        // Processing order: columns 3, 0, 2, 1
        let codes = array![[1.0, 2.0, 3.0, 4.0]];
        let scale = array![[1.0, 10.0]];
        let zero = array![[0.0, 0.0]];
        GptqOutput::new(
            codes,
            &[1, 4],
            scale,
            zero,
            Some(Array1::from(vec![3usize, 0, 2, 1])),
            GroupSize::Columns(2),
            false,
            Maxq::from_bits(4),
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn test_invperm_composes_to_identity() {
        let out = grouped_act_order();
        let perm = out.perm().unwrap();
        let inv = out.invperm().unwrap();
        for j in 0..4 {
            assert_eq!(perm[inv[j]], j);
            assert_eq!(inv[perm[j]], j);
        }
    }

    #[test]
    fn test_g_idx_follows_processing_order() {
        let out = grouped_act_order();
        // Column 3 and 0 were processed first
        assert_eq!(out.g_idx().to_vec(), vec![0, 1, 1, 0]);
        assert_eq!(out.topology(), Topology::GroupedActOrder);
        assert!(!out.topology().fusable());
    }

    #[test]
    fn test_dequantize_gathers_groups() {
        let out = grouped_act_order();
        let w = out.dequantize().unwrap();
        assert_eq!(w.row(0).to_vec(), vec![1.0, 20.0, 30.0, 4.0]);

        let registry = DequantRegistry::with_defaults();
        let via_registry = out.dequantize_with(&registry, Precision::F32).unwrap();
        assert_eq!(via_registry, w);
    }

    #[test]
    fn test_inexact_codes_rejected() {
        let result = GptqOutput::<half::bf16>::new(
            array![[513.0, 12.0]],
            &[1, 2],
            array![[0.5]],
            array![[3.0]],
            None,
            GroupSize::WholeRow,
            false,
            Maxq::from_bits(10),
            0.0,
        );
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_symmetric_ternary_keeps_zero() {
        let out: GptqOutput<f32> = GptqOutput::new(
            array![[0.0, 1.0, 2.0]],
            &[1, 3],
            array![[3.0]],
            array![[-3.0]],
            None,
            GroupSize::WholeRow,
            true,
            Maxq::Ternary,
            0.0,
        )
        .unwrap();
        assert_eq!(out.zero().unwrap()[[0, 0]], -3.0);
        assert_eq!(out.dequantize().unwrap().row(0).to_vec(), vec![-3.0, 0.0, 3.0]);
    }

    #[test]
    fn test_symmetric_hides_zero() {
        let out: GptqOutput<f64> = GptqOutput::new(
            array![[8.0, 9.0]],
            &[1, 2],
            array![[0.5]],
            array![[8.0]],
            None,
            GroupSize::WholeRow,
            true,
            Maxq::from_bits(4),
            0.0,
        )
        .unwrap();
        assert!(out.zero().is_none());
        assert_eq!(out.zero_points()[[0, 0]], 8.0);
        assert_eq!(out.g_idx().to_vec(), vec![0, 0]);
        assert_eq!(out.dequantize().unwrap().row(0).to_vec(), vec![0.0, 0.5]);
    }
}
