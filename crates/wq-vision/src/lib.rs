// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Blind image quality assessment for WaveQ.
//!
//! A frozen [`models::VisionTransformer`] is tapped at four depths, the taps
//! are refined by two wavelet-attention / quaternion-fusion / windowed
//! attention stages and a dual-head pooling layer turns the refined grid into
//! one score per image. [`datasets`] reads annotated quality datasets.

pub mod datasets;
pub mod models;

pub use datasets::{DatasetOptions, QualityDataset, SamplePolicy};
pub use models::iqa::{PipelineConfig, PipelineState, QualityScoringPipeline, StageContract};
pub use wq_tensor::{FeatureGrid, FeatureTensor, PureResult, Tensor, TensorError};
