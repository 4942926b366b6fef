// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use wq_tensor::{PureResult, TensorError};

use super::pooling::DEFAULT_POOLING_EPSILON;

/// Construction parameters of the quality scoring pipeline.
///
/// `embed_dim` is both the backbone token width and the width of the first
/// refinement stage; the second stage runs at `embed_dim / 2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub embed_dim: usize,
    pub num_outputs: usize,
    pub patch_size: usize,
    pub img_size: usize,
    pub depths: Vec<usize>,
    pub window_size: usize,
    pub dim_mlp: usize,
    pub num_heads: Vec<usize>,
    /// Wavelet attention repeats per stage.
    pub num_tab: usize,
    pub scale: f32,
    pub drop: f32,
    pub backbone_depth: usize,
    pub backbone_heads: usize,
    pub backbone_mlp_ratio: usize,
    pub tap_depths: [usize; 4],
    pub pooling_epsilon: f32,
    pub seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embed_dim: 72,
            num_outputs: 1,
            patch_size: 8,
            img_size: 224,
            depths: vec![2, 2],
            window_size: 4,
            dim_mlp: 768,
            num_heads: vec![4, 4],
            num_tab: 2,
            scale: 0.8,
            drop: 0.1,
            backbone_depth: 12,
            backbone_heads: 12,
            backbone_mlp_ratio: 4,
            tap_depths: [6, 7, 8, 9],
            pooling_epsilon: DEFAULT_POOLING_EPSILON,
            seed: None,
        }
    }
}

fn invalid(label: &'static str, message: impl Into<String>) -> TensorError {
    TensorError::configuration(label, message)
}

impl PipelineConfig {
    pub fn from_json(raw: &str) -> PureResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|err| {
            TensorError::SerializationError {
                message: err.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> PureResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| TensorError::SerializationError {
            message: err.to_string(),
        })
    }

    /// Side length of the patch grid.
    pub fn grid_side(&self) -> usize {
        self.img_size / self.patch_size.max(1)
    }

    /// Token count per channel once the class token is dropped.
    pub fn tokens(&self) -> usize {
        self.grid_side() * self.grid_side()
    }

    /// Checks every structural contract the pipeline relies on.
    pub fn validate(&self) -> PureResult<()> {
        if self.patch_size == 0 || self.img_size == 0 || self.img_size % self.patch_size != 0 {
            return Err(invalid(
                "config.patch_size",
                format!(
                    "img_size {} is not a multiple of patch_size {}",
                    self.img_size, self.patch_size
                ),
            ));
        }
        // stage 1 fuses 4·D into D and stage 2 halves it; both must be quaternion-aligned
        if self.embed_dim == 0 || self.embed_dim % 8 != 0 {
            return Err(invalid(
                "config.embed_dim",
                format!(
                    "embed_dim {} must be a positive multiple of 8",
                    self.embed_dim
                ),
            ));
        }
        if self.num_outputs == 0 {
            return Err(invalid("config.num_outputs", "at least one output is required"));
        }
        if self.depths.is_empty() || self.depths.len() != self.num_heads.len() {
            return Err(invalid(
                "config.num_heads",
                format!(
                    "{} depths but {} head counts",
                    self.depths.len(),
                    self.num_heads.len()
                ),
            ));
        }
        for &heads in &self.num_heads {
            let half = self.embed_dim / 2;
            if heads == 0 || self.embed_dim % heads != 0 || half % heads != 0 {
                return Err(invalid(
                    "config.num_heads",
                    format!(
                        "{heads} heads do not divide widths {} and {half}",
                        self.embed_dim
                    ),
                ));
            }
        }
        if self.backbone_heads == 0 || self.embed_dim % self.backbone_heads != 0 {
            return Err(invalid(
                "config.backbone_heads",
                format!(
                    "{} heads do not divide backbone width {}",
                    self.backbone_heads, self.embed_dim
                ),
            ));
        }
        if let Some(&deepest) = self.tap_depths.iter().max() {
            if deepest >= self.backbone_depth {
                return Err(invalid(
                    "config.tap_depths",
                    format!(
                        "tap depth {deepest} needs at least {} backbone blocks, got {}",
                        deepest + 1,
                        self.backbone_depth
                    ),
                ));
            }
        }
        if !(0.0..1.0).contains(&self.drop) {
            return Err(TensorError::InvalidValue {
                label: "config.drop",
            });
        }
        if !(self.pooling_epsilon > 0.0) || !self.pooling_epsilon.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "config.pooling_epsilon",
            });
        }
        if !self.scale.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "config.scale",
                value: self.scale,
            });
        }
        if self.window_size == 0 || self.dim_mlp == 0 || self.backbone_mlp_ratio == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: self.window_size,
                cols: self.dim_mlp,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.grid_side(), 28);
        assert_eq!(config.tokens(), 784);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = PipelineConfig::from_json(r#"{ "num_tab": 1, "seed": 7 }"#).unwrap();
        assert_eq!(config.num_tab, 1);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.embed_dim, 72);
        let round = PipelineConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(round, config);
    }

    #[test]
    fn structural_violations_are_configuration_errors() {
        let cases = [
            PipelineConfig {
                embed_dim: 70,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                img_size: 100,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                backbone_depth: 9,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                num_heads: vec![4],
                ..PipelineConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(TensorError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn non_positive_epsilon_is_rejected() {
        let config = PipelineConfig {
            pooling_epsilon: 0.0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
