//! Host model interface and a reference chain of linear layers

use super::capture::{CaptureControl, CaptureSink, ForwardOutcome};
use crate::quant::Element;
use crate::{Error, Result};
use ndarray::{Array2, ArrayD, ArrayViewD, IxDyn};

/// One transformer-style block of a host model.
///
/// The driver never owns the model: it asks the block for weights, writes
/// quantized weights back and replays hidden states through `forward`.
pub trait QuantBlock {
    /// Element type of the block's weights
    type Elem: Element;

    /// Quantizable sub-layer names in forward order
    fn sub_layers(&self) -> Vec<String>;

    /// Weight of a sub-layer, `[out, in, …]`
    fn weight(&self, name: &str) -> Result<ArrayViewD<'_, Self::Elem>>;

    fn set_weight(&mut self, name: &str, weight: ArrayD<Self::Elem>) -> Result<()>;

    /// Run the block, reporting every sub-layer's `(input, output)` to `sink`.
    ///
    /// Must return [`ForwardOutcome::Stopped`] as soon as the sink answers
    /// [`CaptureControl::Stop`].
    fn forward(&self, hidden: ArrayViewD<'_, f64>, sink: &mut dyn CaptureSink) -> Result<ForwardOutcome>;
}

/// Number of input channels of a `[out, in, …]` weight
pub fn weight_columns(shape: &[usize]) -> Result<usize> {
    if shape.len() < 2 {
        return Err(Error::ShapeMismatch {
            expected: vec![0, 0],
            got: shape.to_vec(),
        });
    }
    Ok(shape[1..].iter().product())
}

/// Convert to `[rows, columns]` in `f64`
pub fn to_matrix<A: Element>(x: ArrayViewD<'_, A>) -> Result<Array2<f64>> {
    let shape = x.shape().to_vec();
    let cols = weight_columns(&shape)?;
    let data = x
        .iter()
        .map(|&v| num_traits::cast::<A, f64>(v).unwrap_or(f64::NAN))
        .collect();
    Array2::from_shape_vec((shape[0], cols), data)
        .map_err(|e| Error::InvalidParameter(format!("cannot flatten {shape:?}: {e}")))
}

/// Convert a `[rows, columns]` matrix back to the host shape and type
pub fn from_matrix<A: Element>(x: &Array2<f64>, shape: &[usize]) -> Result<ArrayD<A>> {
    let data = x
        .iter()
        .map(|&v| {
            num_traits::cast::<f64, A>(v).ok_or_else(|| {
                Error::InvalidParameter(format!("{v} is not representable as {}", A::PRECISION.name()))
            })
        })
        .collect::<Result<Vec<A>>>()?;
    ArrayD::from_shape_vec(IxDyn(shape), data)
        .map_err(|e| Error::InvalidParameter(format!("cannot restore shape {shape:?}: {e}")))
}

/// A single linear layer `y = x Wᵀ`, one block of a [`LinearChain`]
#[derive(Clone, Debug, PartialEq)]
pub struct LinearLayer<A> {
    name: String,
    weight: ArrayD<A>,
}

impl<A: Element> LinearLayer<A> {
    /// `weight` is `[out, in]` (or higher rank, flattened after the first axis)
    pub fn new(name: impl Into<String>, weight: ArrayD<A>) -> Result<Self> {
        weight_columns(weight.shape())?;
        Ok(Self {
            name: name.into(),
            weight,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1..].iter().product()
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Plain forward pass without capture
    pub fn apply(&self, x: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        let (_, y) = self.project(x)?;
        Ok(y)
    }

    fn project(&self, x: ArrayViewD<'_, f64>) -> Result<(Array2<f64>, ArrayD<f64>)> {
        let inputs = crate::gptq::flatten_input(x.view(), self.in_features())?;
        let w = to_matrix(self.weight.view())?;
        let y = inputs.dot(&w.t());

        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = self.out_features();
        }
        let y = ArrayD::from_shape_vec(IxDyn(&shape), y.iter().copied().collect())
            .map_err(|e| Error::InvalidParameter(format!("cannot reshape output: {e}")))?;
        Ok((inputs, y))
    }
}

impl<A: Element> QuantBlock for LinearLayer<A> {
    type Elem = A;

    fn sub_layers(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    fn weight(&self, name: &str) -> Result<ArrayViewD<'_, A>> {
        if name != self.name {
            return Err(Error::UnknownLayer(name.to_string()));
        }
        Ok(self.weight.view())
    }

    fn set_weight(&mut self, name: &str, weight: ArrayD<A>) -> Result<()> {
        if name != self.name {
            return Err(Error::UnknownLayer(name.to_string()));
        }
        if weight.shape() != self.weight.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.weight.shape().to_vec(),
                got: weight.shape().to_vec(),
            });
        }
        self.weight = weight;
        Ok(())
    }

    fn forward(&self, hidden: ArrayViewD<'_, f64>, sink: &mut dyn CaptureSink) -> Result<ForwardOutcome> {
        let (inputs, y) = self.project(hidden)?;
        let flat_out = y
            .view()
            .into_shape_with_order((inputs.nrows(), self.out_features()))
            .map_err(|e| Error::InvalidParameter(format!("cannot flatten output: {e}")))?;
        match sink.capture(&self.name, inputs.view().into_dyn(), flat_out.into_dyn())? {
            CaptureControl::Stop => Ok(ForwardOutcome::Stopped),
            CaptureControl::Continue => Ok(ForwardOutcome::Completed(y)),
        }
    }
}

/// Sequence of linear layers, each its own block
#[derive(Clone, Debug, PartialEq)]
pub struct LinearChain<A> {
    blocks: Vec<LinearLayer<A>>,
}

impl<A: Element> LinearChain<A> {
    /// Consecutive layers must agree on feature sizes
    pub fn new(blocks: Vec<LinearLayer<A>>) -> Result<Self> {
        for pair in blocks.windows(2) {
            if pair[0].out_features() != pair[1].in_features() {
                return Err(Error::ShapeMismatch {
                    expected: vec![pair[1].out_features(), pair[0].out_features()],
                    got: vec![pair[1].out_features(), pair[1].in_features()],
                });
            }
        }
        Ok(Self { blocks })
    }

    /// Build a chain from tensors named `"{prefix}.{block}.{sub_layer}"`.
    ///
    /// Block indices must run from 0 without gaps, one tensor per block.
    pub fn from_named(tensors: Vec<(String, ArrayD<A>)>, prefix: &str) -> Result<Self> {
        let mut indexed = tensors
            .into_iter()
            .map(|(name, weight)| {
                let (index, sub_layer) = name
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .and_then(|rest| rest.split_once('.'))
                    .and_then(|(index, sub)| Some((index.parse::<usize>().ok()?, sub)))
                    .ok_or_else(|| Error::UnknownLayer(name.clone()))?;
                Ok((index, LinearLayer::new(sub_layer, weight)?))
            })
            .collect::<Result<Vec<_>>>()?;
        indexed.sort_by_key(|(index, _)| *index);
        for (position, (index, layer)) in indexed.iter().enumerate() {
            if *index != position {
                return Err(Error::InvalidParameter(format!(
                    "expected block {position} under prefix {prefix:?}, found {index} ({})",
                    layer.name()
                )));
            }
        }
        Self::new(indexed.into_iter().map(|(_, layer)| layer).collect())
    }

    pub fn blocks(&self) -> &[LinearLayer<A>] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [LinearLayer<A>] {
        &mut self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Run every block in order
    pub fn forward(&self, x: ArrayViewD<'_, f64>) -> Result<ArrayD<f64>> {
        let mut hidden = x.to_owned();
        for block in &self.blocks {
            hidden = block.apply(hidden.view())?;
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::capture::PassThrough;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array3};

    struct StopImmediately;

    impl CaptureSink for StopImmediately {
        fn capture(
            &mut self,
            _layer: &str,
            _input: ArrayViewD<'_, f64>,
            _output: ArrayViewD<'_, f64>,
        ) -> Result<CaptureControl> {
            Ok(CaptureControl::Stop)
        }
    }

    fn layer() -> LinearLayer<f32> {
        LinearLayer::new("proj", array![[1.0f32, 2.0], [0.0, -1.0], [0.5, 0.5]].into_dyn()).unwrap()
    }

    #[test]
    fn test_forward_matches_matmul() {
        let l = layer();
        let x = array![[1.0, 1.0], [2.0, -1.0]];
        let out = l.forward(x.view().into_dyn(), &mut PassThrough).unwrap().into_hidden().unwrap();
        assert_eq!(out.shape(), &[2, 3]);
        assert_abs_diff_eq!(out[IxDyn(&[0, 0])], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[IxDyn(&[1, 1])], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_forward_keeps_leading_axes() {
        let l = layer();
        let x = Array3::<f64>::ones((2, 4, 2));
        let out = l.apply(x.view().into_dyn()).unwrap();
        assert_eq!(out.shape(), &[2, 4, 3]);
    }

    #[test]
    fn test_forward_stops_when_asked() {
        let l = layer();
        let x = array![[1.0, 1.0]];
        let outcome = l.forward(x.view().into_dyn(), &mut StopImmediately).unwrap();
        assert_eq!(outcome, ForwardOutcome::Stopped);
    }

    #[test]
    fn test_set_weight_checks_name_and_shape() {
        let mut l = layer();
        assert!(matches!(
            l.set_weight("other", ArrayD::zeros(IxDyn(&[3, 2]))),
            Err(Error::UnknownLayer(_))
        ));
        assert!(l.set_weight("proj", ArrayD::zeros(IxDyn(&[2, 2]))).is_err());
        assert!(l.set_weight("proj", ArrayD::zeros(IxDyn(&[3, 2]))).is_ok());
    }

    #[test]
    fn test_chain_checks_feature_sizes() {
        let a = layer();
        let bad = LinearLayer::new("proj", ArrayD::<f32>::zeros(IxDyn(&[2, 2]))).unwrap();
        assert!(LinearChain::new(vec![a.clone(), bad]).is_err());
        let good = LinearLayer::new("proj", ArrayD::<f32>::zeros(IxDyn(&[2, 3]))).unwrap();
        let chain = LinearChain::new(vec![a, good]).unwrap();
        let out = chain.forward(array![[1.0, 2.0]].view().into_dyn()).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
    }

    #[test]
    fn test_chain_from_named_tensors() {
        let tensors = vec![
            ("layers.1.down".to_string(), ArrayD::<f32>::zeros(IxDyn(&[2, 3]))),
            ("layers.0.up".to_string(), ArrayD::<f32>::zeros(IxDyn(&[3, 2]))),
        ];
        let chain = LinearChain::from_named(tensors, "layers").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.blocks()[0].name(), "up");
        assert_eq!(chain.blocks()[1].sub_layers(), vec!["down".to_string()]);
    }

    #[test]
    fn test_chain_from_named_rejects_gaps_and_strangers() {
        let gap = vec![("layers.1.proj".to_string(), ArrayD::<f32>::zeros(IxDyn(&[2, 2])))];
        assert!(matches!(
            LinearChain::from_named(gap, "layers"),
            Err(Error::InvalidParameter(_))
        ));
        let stranger = vec![("lm_head".to_string(), ArrayD::<f32>::zeros(IxDyn(&[2, 2])))];
        assert!(matches!(
            LinearChain::from_named(stranger, "layers"),
            Err(Error::UnknownLayer(_))
        ));
    }

    #[test]
    fn test_matrix_conversions() {
        let w = Array3::<f32>::from_shape_fn((2, 3, 2), |(a, b, c)| (a * 6 + b * 2 + c) as f32);
        let m = to_matrix(w.view().into_dyn()).unwrap();
        assert_eq!(m.dim(), (2, 6));
        assert_eq!(m[[1, 0]], 6.0);
        let back: ArrayD<f32> = from_matrix(&m, &[2, 3, 2]).unwrap();
        assert_eq!(back, w.into_dyn());
    }
}
