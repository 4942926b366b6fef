// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

// crates/wq-tensor/src/lib.rs
pub mod feature;
pub mod pure;
pub mod quaternion;
pub mod wavelet;

pub use feature::{FeatureGrid, FeatureTensor};
pub use pure::{gelu, sigmoid, PureResult, Tensor, TensorError};
pub use quaternion::QuaternionKernel;
