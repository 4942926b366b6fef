// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use wq_tensor::{PureResult, Tensor};

/// Sequential container that mirrors `nn.Sequential`.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a new layer to the sequence.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Builder form of [`Self::push`].
    pub fn with<M>(mut self, layer: M) -> Self
    where
        M: Module + 'static,
    {
        self.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut activ = input.clone();
        for layer in &self.layers {
            activ = layer.forward(&activ)?;
        }
        Ok(activ)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Dropout, Linear, Relu};

    #[test]
    fn sequential_chains_layers_in_order() {
        let l1 = Linear::with_seed("l1", 2, 3, Some(1)).unwrap();
        let l2 = Linear::with_seed("l2", 3, 1, Some(2)).unwrap();
        let input = Tensor::from_vec(1, 2, vec![0.5, -0.1]).unwrap();
        let mut expected = l1.forward(&input).unwrap();
        expected.relu_inplace();
        let expected = l2.forward(&expected).unwrap();

        let seq = Sequential::new().with(l1).with(Relu::new()).with(l2);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.forward(&input).unwrap(), expected);
        assert_eq!(seq.state_dict().unwrap().len(), 4);
    }

    #[test]
    fn training_flag_reaches_nested_dropout() {
        let seq = Sequential::new().with(Dropout::with_seed(0.9, Some(3)).unwrap());
        let input = Tensor::full(4, 4, 1.0).unwrap();
        seq.set_training(false);
        assert_eq!(seq.forward(&input).unwrap(), input);
    }
}
