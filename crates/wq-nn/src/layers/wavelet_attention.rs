// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Wavelet-domain channel attention.
//!
//! Each `(channels, tokens)` item is low-passed along the token axis with a
//! single-level Haar transform, projected to queries, keys and values of the
//! same width, and attended across channels. The result is re-laid out
//! tokens-major, reinterpreted as `(channels, tokens)` and added back onto the
//! untransformed input.

use super::dropout::Dropout;
use super::linear::Linear;
use crate::module::{Module, Parameter};
use tracing::trace;
use wq_tensor::wavelet::{haar_lowpass, haar_lowpass_rows};
use wq_tensor::{FeatureTensor, PureResult, Tensor, TensorError};

/// Dropout applied after the attention mix unless overridden.
pub const DEFAULT_WAVELET_DROPOUT: f32 = 0.1;

#[derive(Debug)]
pub struct WaveletAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: Dropout,
    tokens: usize,
    norm_factor: f32,
}

impl WaveletAttention {
    pub fn new(name: impl Into<String>, tokens: usize) -> PureResult<Self> {
        Self::with_seed(name, tokens, DEFAULT_WAVELET_DROPOUT, None)
    }

    /// Builds the block for rows of `tokens` entries; the attention scale is
    /// `tokens^-1/2`.
    pub fn with_seed(
        name: impl Into<String>,
        tokens: usize,
        dropout: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        Ok(Self {
            query: Linear::with_seed(format!("{name}.c_q"), tokens, tokens, seed)?,
            key: Linear::with_seed(format!("{name}.c_k"), tokens, tokens, seed)?,
            value: Linear::with_seed(format!("{name}.c_v"), tokens, tokens, seed)?,
            dropout: Dropout::with_seed(dropout, seed.map(|s| s ^ 0x5741_4141))?,
            tokens,
            norm_factor: (tokens as f32).powf(-0.5),
        })
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    fn check(&self, input: &Tensor) -> PureResult<()> {
        if input.shape().1 != self.tokens {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input.shape().0, self.tokens),
            });
        }
        Ok(())
    }

    /// Attention over an already transformed item, residual against `input`.
    fn attend(&self, input: &Tensor, transformed: &Tensor) -> PureResult<Tensor> {
        let (channels, tokens) = input.shape();
        let q = self.query.forward(transformed)?;
        let k = self.key.forward(transformed)?;
        let v = self.value.forward(transformed)?;
        let attn = q
            .matmul_transposed(&k)?
            .scale(self.norm_factor)?
            .row_softmax()?;
        let mixed = attn.matmul(&v)?.transpose().reshape(channels, tokens)?;
        let mixed = self.dropout.forward(&mixed)?;
        mixed.add(input)
    }

    /// Runs the block over a whole batch with one batched wavelet transform.
    pub fn forward_batch(&self, input: &FeatureTensor) -> PureResult<FeatureTensor> {
        let (channels, tokens) = input.item_shape();
        self.check(&input.items()[0])?;
        trace!(batch = input.batch(), channels, tokens, "wavelet attention");
        let transformed = haar_lowpass(input)?;
        let items = input
            .items()
            .iter()
            .zip(transformed.items())
            .map(|(x, xw)| self.attend(x, xw))
            .collect::<PureResult<Vec<_>>>()?;
        FeatureTensor::new(items)
    }
}

impl Module for WaveletAttention {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check(input)?;
        let transformed = haar_lowpass_rows(input)?;
        self.attend(input, &transformed)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.query.visit_parameters(visitor)?;
        self.key.visit_parameters(visitor)?;
        self.value.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.query.visit_parameters_mut(visitor)?;
        self.key.visit_parameters_mut(visitor)?;
        self.value.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }
}
