// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use approx::assert_relative_eq;
use tempfile::tempdir;
use wq_nn::io;
use wq_nn::module::{Module, Parameter};
use wq_tensor::{FeatureGrid, FeatureTensor, PureResult, Tensor, TensorError};

use wq_vision::models::iqa::{PipelineConfig, PipelineState, QualityScoringPipeline};
use wq_vision::models::{Backbone, SwinConfig, SwinStage};

fn small_config(seed: u64) -> PipelineConfig {
    PipelineConfig {
        embed_dim: 16,
        patch_size: 4,
        img_size: 16,
        depths: vec![1, 1],
        num_heads: vec![2, 2],
        window_size: 2,
        dim_mlp: 32,
        num_tab: 2,
        backbone_depth: 5,
        backbone_heads: 4,
        backbone_mlp_ratio: 2,
        tap_depths: [1, 2, 3, 4],
        seed: Some(seed),
        ..PipelineConfig::default()
    }
}

fn patterned(side: usize, phase: f32, offset: f32) -> Tensor {
    let plane = side * side;
    Tensor::from_fn(3, plane, |c, p| {
        let (y, x) = ((p / side) as f32, (p % side) as f32);
        let v = 0.5 + 0.4 * ((x * 0.11 + phase) * (c as f32 + 1.0)).sin() * (y * 0.07).cos();
        v + offset
    })
    .unwrap()
}

fn swin(width: usize, resolution: (usize, usize)) -> SwinStage {
    SwinStage::new(
        "injected",
        SwinConfig {
            resolution,
            embed_dim: width,
            depths: vec![1],
            num_heads: vec![2],
            window_size: 2,
            dim_mlp: 16,
            seed: Some(3),
            ..SwinConfig::default()
        },
    )
    .unwrap()
}

/// Backbone that emits fixed, depth-dependent token maps.
#[derive(Debug)]
struct RampBackbone {
    width: usize,
    depth: usize,
    grid: (usize, usize),
}

impl Module for RampBackbone {
    fn forward(&self, _input: &Tensor) -> PureResult<Tensor> {
        Tensor::zeros(1, 1)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

impl Backbone for RampBackbone {
    fn forward_blocks(&self, images: &FeatureGrid) -> PureResult<Vec<FeatureTensor>> {
        let tokens = self.grid.0 * self.grid.1 + 1;
        (0..self.depth)
            .map(|d| {
                let items = images
                    .items()
                    .iter()
                    .map(|image| {
                        let mean = image.sum() / image.len() as f32;
                        Tensor::from_fn(tokens, self.width, |t, c| {
                            ((t * self.width + c + d) as f32 * 0.01).sin() + mean
                        })
                    })
                    .collect::<PureResult<Vec<_>>>()?;
                FeatureTensor::new(items)
            })
            .collect()
    }

    fn width(&self) -> usize {
        self.width
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn token_grid(&self) -> (usize, usize) {
        self.grid
    }
}

#[test]
fn all_zero_image_yields_one_finite_score() {
    let _ = wq_config::tracing::init_tracing();
    let config = PipelineConfig {
        embed_dim: 72,
        patch_size: 8,
        img_size: 224,
        num_tab: 2,
        backbone_depth: 10,
        seed: Some(2024),
        ..PipelineConfig::default()
    };
    let pipeline = QualityScoringPipeline::new(config).unwrap();
    pipeline.eval();
    let images = FeatureGrid::zeros(1, 3, (224, 224)).unwrap();
    let scores = pipeline.forward(&images).unwrap();
    assert_eq!(scores.len(), 1);
    assert!(scores[0].is_finite());
}

#[test]
fn brightness_offset_moves_the_score_slightly() {
    let config = PipelineConfig {
        backbone_depth: 10,
        seed: Some(77),
        ..PipelineConfig::default()
    };
    let pipeline = QualityScoringPipeline::new(config).unwrap();
    pipeline.eval();
    let images = FeatureGrid::from_items(
        vec![patterned(224, 0.0, 0.0), patterned(224, 0.0, 0.01)],
        (224, 224),
    )
    .unwrap();
    let scores = pipeline.forward(&images).unwrap();
    assert_ne!(scores[0], scores[1]);
    let scale = (scores[0].abs() + scores[1].abs()).max(0.1);
    assert!(
        (scores[0] - scores[1]).abs() < 0.1 * scale,
        "scores drifted apart: {scores:?}"
    );
}

#[test]
fn scores_follow_input_order() {
    let pipeline = QualityScoringPipeline::new(small_config(11)).unwrap();
    pipeline.eval();
    let a = patterned(16, 0.0, 0.0);
    let b = patterned(16, 1.3, 0.2);
    let c = patterned(16, 2.1, -0.1);
    let forward = FeatureGrid::from_items(vec![a.clone(), b.clone(), c.clone()], (16, 16)).unwrap();
    let reversed = FeatureGrid::from_items(vec![c, b, a.clone()], (16, 16)).unwrap();
    let scores = pipeline.forward(&forward).unwrap();
    let mut back = pipeline.forward(&reversed).unwrap();
    back.reverse();
    assert_eq!(scores.len(), 3);
    for (x, y) in scores.iter().zip(&back) {
        assert_relative_eq!(*x, *y, epsilon = 1e-5);
    }
    let alone = pipeline
        .forward(&FeatureGrid::from_items(vec![a], (16, 16)).unwrap())
        .unwrap();
    assert_relative_eq!(alone[0], scores[0], epsilon = 1e-5);
}

#[test]
fn wrong_image_geometry_is_a_shape_mismatch() {
    let pipeline = QualityScoringPipeline::new(small_config(1)).unwrap();
    for images in [
        FeatureGrid::zeros(1, 3, (8, 8)).unwrap(),
        FeatureGrid::zeros(1, 1, (16, 16)).unwrap(),
        FeatureGrid::zeros(1, 3, (16, 8)).unwrap(),
    ] {
        assert!(matches!(
            pipeline.forward(&images),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}

#[test]
fn dropout_makes_training_passes_stochastic() {
    let pipeline = QualityScoringPipeline::new(small_config(4)).unwrap();
    let images = FeatureGrid::from_items(vec![patterned(16, 0.4, 0.0)], (16, 16)).unwrap();
    pipeline.eval();
    let first = pipeline.forward(&images).unwrap();
    assert_eq!(first, pipeline.forward(&images).unwrap());
    pipeline.train();
    let noisy: Vec<f32> = (0..4)
        .map(|_| pipeline.forward(&images).unwrap()[0])
        .collect();
    assert!(noisy.iter().any(|s| *s != first[0]));
}

#[test]
fn injected_components_are_checked_against_the_contracts() {
    let config = small_config(8);
    let backbone = RampBackbone {
        width: 16,
        depth: 5,
        grid: (4, 4),
    };
    let pipeline = QualityScoringPipeline::with_components(
        config.clone(),
        Box::new(backbone),
        Box::new(swin(16, (4, 4))),
        Box::new(swin(8, (4, 4))),
    )
    .unwrap();
    pipeline.eval();
    let refine = pipeline
        .contracts()
        .iter()
        .find(|c| c.state == PipelineState::Stage2Refine)
        .unwrap();
    assert_eq!((refine.channels, refine.hw), (8, (4, 4)));
    let scores = pipeline
        .forward(&FeatureGrid::zeros(2, 3, (16, 16)).unwrap())
        .unwrap();
    assert!(scores.iter().all(|s| s.is_finite()));

    let swapped = QualityScoringPipeline::with_components(
        config.clone(),
        Box::new(RampBackbone {
            width: 16,
            depth: 5,
            grid: (4, 4),
        }),
        Box::new(swin(8, (4, 4))),
        Box::new(swin(16, (4, 4))),
    );
    assert!(matches!(swapped, Err(TensorError::Configuration { .. })));

    let shallow = QualityScoringPipeline::with_components(
        config,
        Box::new(RampBackbone {
            width: 16,
            depth: 4,
            grid: (4, 4),
        }),
        Box::new(swin(16, (4, 4))),
        Box::new(swin(8, (4, 4))),
    );
    assert!(matches!(shallow, Err(TensorError::Configuration { .. })));
}

#[test]
fn checkpoint_restores_identical_scores() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pipeline.json");
    let source = QualityScoringPipeline::new(small_config(21)).unwrap();
    source.eval();
    io::save_json(&source, &path).unwrap();

    let mut restored = QualityScoringPipeline::new(small_config(99)).unwrap();
    restored.eval();
    let images = FeatureGrid::from_items(vec![patterned(16, 0.9, 0.0)], (16, 16)).unwrap();
    assert_ne!(
        source.forward(&images).unwrap(),
        restored.forward(&images).unwrap()
    );
    io::load_json(&mut restored, &path).unwrap();
    assert_eq!(
        source.forward(&images).unwrap(),
        restored.forward(&images).unwrap()
    );
}
