// SPDX-License-Identifier: AGPL-3.0-or-later

//! Blind image quality scoring on top of a tapped transformer backbone.

pub mod config;
pub mod fusion;
pub mod pipeline;
pub mod pooling;
pub mod taps;

pub use self::config::PipelineConfig;
pub use self::fusion::QuaternionFusion;
pub use self::pipeline::{PipelineState, QualityScoringPipeline, StageContract};
pub use self::pooling::{weighted_mean, WeightedPoolingHead, DEFAULT_POOLING_EPSILON};
pub use self::taps::{TapCollector, DEFAULT_TAP_DEPTHS};
