// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use rand::{rngs::StdRng, Rng};
use std::cell::{Cell, RefCell};
use wq_config::determinism;
use wq_tensor::{PureResult, Tensor, TensorError};

/// Bernoulli dropout layer that mirrors the behaviour of `nn.Dropout`.
pub struct Dropout {
    probability: f32,
    keep_scale: f32,
    train: Cell<bool>,
    rng: RefCell<StdRng>,
}

impl core::fmt::Debug for Dropout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .field("training", &self.train.get())
            .finish()
    }
}

impl Dropout {
    /// Builds a new dropout layer seeded from the determinism settings.
    pub fn new(probability: f32) -> PureResult<Self> {
        Self::with_seed(probability, None)
    }

    /// Builds a new dropout layer with a deterministic RNG seed.
    pub fn with_seed(probability: f32, seed: Option<u64>) -> PureResult<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(TensorError::InvalidValue {
                label: "dropout_probability",
            });
        }
        Ok(Self {
            probability,
            keep_scale: 1.0 / (1.0 - probability),
            train: Cell::new(true),
            rng: RefCell::new(determinism::rng_from_optional(seed, "wq-nn/dropout")),
        })
    }

    /// Returns the probability assigned to zeroing activations.
    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Returns whether the layer currently runs in training mode.
    pub fn is_training(&self) -> bool {
        self.train.get()
    }

    /// Convenience helper that enables training mode.
    pub fn train(&self) {
        self.train.set(true);
    }

    /// Convenience helper that enables evaluation mode.
    pub fn eval(&self) {
        self.train.set(false);
    }

    fn sample_mask(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        let mut rng = self.rng.borrow_mut();
        let mask = (0..rows * cols)
            .map(|_| {
                if rng.gen::<f32>() >= self.probability {
                    self.keep_scale
                } else {
                    0.0
                }
            })
            .collect();
        Tensor::from_vec(rows, cols, mask)
    }
}

impl Module for Dropout {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if !self.is_training() || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let (rows, cols) = input.shape();
        let mask = self.sample_mask(rows, cols)?;
        input.hadamard(&mask)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.train.set(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn mask_from_seed(probability: f32, seed: u64, rows: usize, cols: usize) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        let keep_scale = 1.0 / (1.0 - probability);
        let mask = (0..rows * cols)
            .map(|_| {
                if rng.gen::<f32>() >= probability {
                    keep_scale
                } else {
                    0.0
                }
            })
            .collect();
        Tensor::from_vec(rows, cols, mask).unwrap()
    }

    #[test]
    fn dropout_rejects_invalid_probability() {
        assert!(Dropout::with_seed(-0.1, Some(1)).is_err());
        assert!(Dropout::with_seed(1.0, Some(1)).is_err());
    }

    #[test]
    fn dropout_forward_matches_seeded_mask() {
        let dropout = Dropout::with_seed(0.5, Some(42)).unwrap();
        let input = Tensor::from_vec(2, 3, vec![0.2, -0.3, 0.5, 1.0, -1.2, 0.7]).unwrap();
        let expected = input.hadamard(&mask_from_seed(0.5, 42, 2, 3)).unwrap();
        assert_eq!(dropout.forward(&input).unwrap(), expected);
    }

    #[test]
    fn eval_mode_is_identity() {
        let dropout = Dropout::with_seed(0.3, Some(7)).unwrap();
        dropout.set_training(false);
        let input = Tensor::from_vec(1, 4, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_eq!(dropout.forward(&input).unwrap(), input);
        dropout.train();
        assert!(dropout.is_training());
    }
}
