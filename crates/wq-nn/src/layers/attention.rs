// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::linear::Linear;
use crate::module::{Module, Parameter};
use wq_tensor::{PureResult, Tensor, TensorError};

/// Multi-head scaled dot-product self-attention over `(tokens, dim)` rows.
///
/// A fused `qkv` projection feeds `heads` independent attention maps whose
/// outputs are concatenated and mixed by `proj`.
#[derive(Debug)]
pub struct MultiHeadAttention {
    qkv: Linear,
    proj: Linear,
    heads: usize,
    head_dim: usize,
    scale: f32,
}

impl MultiHeadAttention {
    pub fn new(name: impl Into<String>, dim: usize, heads: usize) -> PureResult<Self> {
        Self::with_seed(name, dim, heads, None)
    }

    pub fn with_seed(
        name: impl Into<String>,
        dim: usize,
        heads: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if heads == 0 || dim % heads != 0 {
            return Err(TensorError::configuration(
                "attention.heads",
                format!("width {dim} is not divisible into {heads} heads"),
            ));
        }
        let name = name.into();
        let head_dim = dim / heads;
        Ok(Self {
            qkv: Linear::with_seed(format!("{name}.qkv"), dim, dim * 3, seed)?,
            proj: Linear::with_seed(format!("{name}.proj"), dim, dim, seed)?,
            heads,
            head_dim,
            scale: (head_dim as f32).powf(-0.5),
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn dim(&self) -> usize {
        self.heads * self.head_dim
    }

    /// Attention with additive score terms.
    ///
    /// `head_bias[h]` is added to head `h`'s `(tokens, tokens)` scores and
    /// `mask` is added to every head; both are applied before the softmax.
    pub fn forward_with_bias(
        &self,
        input: &Tensor,
        head_bias: Option<&[Tensor]>,
        mask: Option<&Tensor>,
    ) -> PureResult<Tensor> {
        let (tokens, _) = input.shape();
        if let Some(bias) = head_bias {
            if bias.len() != self.heads {
                return Err(TensorError::DataLength {
                    expected: self.heads,
                    got: bias.len(),
                });
            }
        }
        let dim = self.dim();
        let qkv = self.qkv.forward(input)?;
        let mut heads_out = Vec::with_capacity(self.heads);
        for h in 0..self.heads {
            let offset = h * self.head_dim;
            let q = qkv.slice_cols(offset, offset + self.head_dim)?;
            let k = qkv.slice_cols(dim + offset, dim + offset + self.head_dim)?;
            let v = qkv.slice_cols(2 * dim + offset, 2 * dim + offset + self.head_dim)?;
            let mut scores = q.matmul_transposed(&k)?.scale(self.scale)?;
            if let Some(bias) = head_bias {
                scores.add_scaled(&bias[h], 1.0)?;
            }
            if let Some(mask) = mask {
                scores.add_scaled(mask, 1.0)?;
            }
            heads_out.push(scores.row_softmax()?.matmul(&v)?);
        }
        let merged = Tensor::cat_cols(&heads_out)?;
        debug_assert_eq!(merged.shape(), (tokens, dim));
        self.proj.forward(&merged)
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.forward_with_bias(input, None, None)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.qkv.visit_parameters(visitor)?;
        self.proj.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.qkv.visit_parameters_mut(visitor)?;
        self.proj.visit_parameters_mut(visitor)
    }
}
