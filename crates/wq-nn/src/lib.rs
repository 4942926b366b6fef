// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Inference-side neural modules for WaveQ.
//!
//! This crate offers a lightweight `nn.Module` style surface: layers own named
//! [`Parameter`]s, expose them through visitors for checkpointing, and run
//! forward passes over one `(rows, cols)` item at a time.

pub mod io;
pub mod layers;
pub mod module;

pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::{
    Conv2d, ConvDirection, Dropout, Gelu, LayerNorm, Linear, MultiHeadAttention,
    QuaternionConv2d, Relu, Sequential, Sigmoid, WaveletAttention,
};
pub use module::{Module, Parameter};

pub use wq_tensor::{FeatureGrid, FeatureTensor, PureResult, Tensor, TensorError};
