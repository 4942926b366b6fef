// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Vision models implemented on top of the WaveQ neural module stack.
//!
//! Each model implements [`wq_nn::module::Module`], so checkpoints can be
//! exported and loaded through the parameter visitors.

mod utils;

pub mod iqa;
pub mod swin;
pub mod vit;

pub use self::iqa::{PipelineConfig, QualityScoringPipeline};
pub use self::swin::{HierarchicalStage, SwinConfig, SwinStage};
pub use self::vit::{Backbone, ViTConfig, VisionTransformer};
