// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use wq_tensor::{PureResult, Tensor, TensorError};

/// Layer normalisation over the last axis of every row.
#[derive(Debug)]
pub struct LayerNorm {
    features: usize,
    epsilon: f32,
    gamma: Parameter,
    beta: Parameter,
}

impl LayerNorm {
    /// Builds a new layer normalisation module with unit gain and zero shift.
    pub fn new(name: impl Into<String>, features: usize, epsilon: f32) -> PureResult<Self> {
        if features == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: features,
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "layernorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        Ok(Self {
            features,
            epsilon,
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::full(1, features, 1.0)?),
            beta: Parameter::new(format!("{name}::beta"), Tensor::zeros(1, features)?),
        })
    }

    /// Returns the number of features normalised per row.
    pub fn features(&self) -> usize {
        self.features
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }
}

impl Module for LayerNorm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (rows, cols) = input.shape();
        if cols != self.features {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.features),
            });
        }
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let inv_cols = 1.0 / cols as f32;
        let mut out = Vec::with_capacity(rows * cols);
        for row in input.data().chunks(cols) {
            let mean = row.iter().sum::<f32>() * inv_cols;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() * inv_cols;
            let inv_std = 1.0 / (var + self.epsilon).sqrt();
            for ((value, g), b) in row.iter().zip(gamma).zip(beta) {
                out.push((value - mean) * inv_std * g + b);
            }
        }
        Tensor::from_vec(rows, cols, out)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_whitened() {
        let norm = LayerNorm::new("ln", 4, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 4, vec![1.0, 2.0, 3.0, 4.0, -5.0, 0.0, 5.0, 10.0]).unwrap();
        let out = norm.forward(&input).unwrap();
        for row in out.data().chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn constant_rows_stay_finite() {
        let norm = LayerNorm::new("ln", 3, 1e-6).unwrap();
        let out = norm.forward(&Tensor::zeros(1, 3).unwrap()).unwrap();
        assert!(out.is_finite());
        assert!(LayerNorm::new("ln", 3, 0.0).is_err());
    }
}
