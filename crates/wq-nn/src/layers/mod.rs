// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod attention;
pub mod conv;
pub mod dropout;
pub mod gelu;
pub mod linear;
pub mod normalization;
pub mod quaternion_conv;
pub mod sequential;
pub mod wavelet_attention;

pub use activation::{Relu, Sigmoid};
pub use attention::MultiHeadAttention;
pub use conv::{Conv2d, ConvGeometry};
pub use dropout::Dropout;
pub use gelu::Gelu;
pub use linear::Linear;
pub use normalization::LayerNorm;
pub use quaternion_conv::{ConvDirection, QuaternionConv2d};
pub use sequential::Sequential;
pub use wavelet_attention::WaveletAttention;
