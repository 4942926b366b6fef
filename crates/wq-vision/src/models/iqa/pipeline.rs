// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use tracing::{debug, info};
use wq_nn::layers::WaveletAttention;
use wq_nn::layers::wavelet_attention::DEFAULT_WAVELET_DROPOUT;
use wq_nn::module::{Module, Parameter};
use wq_tensor::{FeatureGrid, FeatureTensor, PureResult, Tensor, TensorError};

use super::config::PipelineConfig;
use super::fusion::QuaternionFusion;
use super::pooling::WeightedPoolingHead;
use super::taps::TapCollector;
use crate::models::swin::{HierarchicalStage, SwinConfig, SwinStage};
use crate::models::utils::{check_image, derive_layer_seed};
use crate::models::vit::{Backbone, ViTConfig, VisionTransformer};

const IMAGE_CHANNELS: usize = 3;

/// Steps of one scoring pass, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    BackboneForward,
    FeatureExtracted,
    Stage1Attention,
    Stage1Fusion,
    Stage1Refine,
    Stage2Attention,
    Stage2Fusion,
    Stage2Refine,
    Pooled,
}

impl PipelineState {
    pub const ALL: [PipelineState; 9] = [
        PipelineState::BackboneForward,
        PipelineState::FeatureExtracted,
        PipelineState::Stage1Attention,
        PipelineState::Stage1Fusion,
        PipelineState::Stage1Refine,
        PipelineState::Stage2Attention,
        PipelineState::Stage2Fusion,
        PipelineState::Stage2Refine,
        PipelineState::Pooled,
    ];
}

/// Per-image output shape of a state: `channels` feature maps over `hw`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageContract {
    pub state: PipelineState,
    pub channels: usize,
    pub hw: (usize, usize),
}

/// Backbone taps followed by two wavelet / quaternion / windowed-attention
/// refinement stages and a weighted pooling head.
pub struct QualityScoringPipeline {
    config: PipelineConfig,
    backbone: Box<dyn Backbone>,
    stage1_attention: Vec<WaveletAttention>,
    stage1_fusion: QuaternionFusion,
    stage1_refine: Box<dyn HierarchicalStage>,
    stage2_attention: Vec<WaveletAttention>,
    stage2_fusion: QuaternionFusion,
    stage2_refine: Box<dyn HierarchicalStage>,
    head: WeightedPoolingHead,
    contracts: Vec<StageContract>,
}

impl fmt::Debug for QualityScoringPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityScoringPipeline")
            .field("embed_dim", &self.config.embed_dim)
            .field("img_size", &self.config.img_size)
            .field("num_tab", &self.config.num_tab)
            .field("backbone_depth", &self.backbone.depth())
            .finish()
    }
}

impl QualityScoringPipeline {
    /// Builds the pipeline with a [`VisionTransformer`] backbone and two
    /// [`SwinStage`] refinements.
    pub fn new(config: PipelineConfig) -> PureResult<Self> {
        config.validate()?;
        let side = config.grid_side();
        let backbone = VisionTransformer::new(ViTConfig {
            image_hw: (config.img_size, config.img_size),
            patch_size: config.patch_size,
            in_channels: IMAGE_CHANNELS,
            embed_dim: config.embed_dim,
            depth: config.backbone_depth,
            num_heads: config.backbone_heads,
            mlp_ratio: config.backbone_mlp_ratio,
            seed: derive_layer_seed(config.seed, "vit"),
            ..ViTConfig::default()
        })?;
        let swin = |name: &str, width: usize| {
            SwinStage::new(
                name,
                SwinConfig {
                    resolution: (side, side),
                    embed_dim: width,
                    depths: config.depths.clone(),
                    num_heads: config.num_heads.clone(),
                    window_size: config.window_size,
                    dim_mlp: config.dim_mlp,
                    scale: config.scale,
                    seed: derive_layer_seed(config.seed, name),
                    ..SwinConfig::default()
                },
            )
        };
        let stage1 = swin("swintransformer1", config.embed_dim)?;
        let stage2 = swin("swintransformer2", config.embed_dim / 2)?;
        Self::with_components(
            config,
            Box::new(backbone),
            Box::new(stage1),
            Box::new(stage2),
        )
    }

    /// Builds the pipeline around injected collaborators, checking them
    /// against the stage contracts derived from `config`.
    pub fn with_components(
        config: PipelineConfig,
        backbone: Box<dyn Backbone>,
        stage1: Box<dyn HierarchicalStage>,
        stage2: Box<dyn HierarchicalStage>,
    ) -> PureResult<Self> {
        config.validate()?;
        let contracts = Self::derive_contracts(&config);
        let grid = (config.grid_side(), config.grid_side());
        let dim = config.embed_dim;

        if backbone.width() != dim {
            return Err(TensorError::configuration(
                "pipeline.backbone",
                format!("backbone width {} but embed_dim {dim}", backbone.width()),
            ));
        }
        if backbone.token_grid() != grid {
            return Err(TensorError::configuration(
                "pipeline.backbone",
                format!(
                    "backbone token grid {:?} but patch grid {grid:?}",
                    backbone.token_grid()
                ),
            ));
        }
        let deepest = config.tap_depths.iter().max().copied().unwrap_or(0);
        if backbone.depth() <= deepest {
            return Err(TensorError::configuration(
                "pipeline.backbone",
                format!(
                    "backbone has {} blocks but tap depth {deepest} is requested",
                    backbone.depth()
                ),
            ));
        }
        for (label, stage, contract) in [
            ("pipeline.stage1", &stage1, contracts[4]),
            ("pipeline.stage2", &stage2, contracts[7]),
        ] {
            if stage.channels() != contract.channels || stage.resolution() != contract.hw {
                return Err(TensorError::configuration(
                    label,
                    format!(
                        "stage works on {} channels over {:?}, expected {} over {:?}",
                        stage.channels(),
                        stage.resolution(),
                        contract.channels,
                        contract.hw
                    ),
                ));
            }
        }

        let tokens = config.tokens();
        let seed = config.seed;
        let attention = |prefix: &str| {
            (0..config.num_tab)
                .map(|idx| {
                    let name = format!("{prefix}.{idx}");
                    let layer_seed = derive_layer_seed(seed, &name);
                    WaveletAttention::with_seed(name, tokens, DEFAULT_WAVELET_DROPOUT, layer_seed)
                })
                .collect::<PureResult<Vec<_>>>()
        };
        let fusion = |name: &str, input: usize, output: usize| {
            QuaternionFusion::new(
                name,
                input,
                output,
                1,
                1,
                true,
                false,
                false,
                grid,
                derive_layer_seed(seed, name),
            )
        };
        let stage1_fusion = fusion("conv1", 4 * dim, dim)?;
        let stage2_fusion = fusion("conv2", dim, dim / 2)?;
        for (fusion, contract) in [(&stage1_fusion, contracts[3]), (&stage2_fusion, contracts[6])] {
            if fusion.output_hw()? != contract.hw {
                return Err(TensorError::configuration(
                    "pipeline.fusion",
                    format!(
                        "fusion maps to {:?}, expected {:?}",
                        fusion.output_hw()?,
                        contract.hw
                    ),
                ));
            }
        }
        let head = WeightedPoolingHead::new(
            "head",
            dim / 2,
            config.num_outputs,
            config.drop,
            config.pooling_epsilon,
            derive_layer_seed(seed, "head"),
        )?;

        let pipeline = Self {
            stage1_attention: attention("tablock1")?,
            stage1_fusion,
            stage1_refine: stage1,
            stage2_attention: attention("tablock2")?,
            stage2_fusion,
            stage2_refine: stage2,
            head,
            backbone,
            contracts,
            config,
        };
        info!(
            embed_dim = dim,
            tokens,
            num_tab = pipeline.config.num_tab,
            parameters = pipeline.parameter_count()?,
            "quality scoring pipeline built"
        );
        Ok(pipeline)
    }

    fn derive_contracts(config: &PipelineConfig) -> Vec<StageContract> {
        let side = config.grid_side();
        let grid = (side, side);
        let dim = config.embed_dim;
        let channels = |state| match state {
            PipelineState::BackboneForward => dim,
            PipelineState::FeatureExtracted | PipelineState::Stage1Attention => 4 * dim,
            PipelineState::Stage1Fusion
            | PipelineState::Stage1Refine
            | PipelineState::Stage2Attention => dim,
            PipelineState::Stage2Fusion | PipelineState::Stage2Refine => dim / 2,
            PipelineState::Pooled => config.num_outputs,
        };
        PipelineState::ALL
            .iter()
            .map(|&state| StageContract {
                state,
                channels: channels(state),
                hw: if state == PipelineState::Pooled {
                    (1, 1)
                } else {
                    grid
                },
            })
            .collect()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Output shape of every state, in execution order.
    pub fn contracts(&self) -> &[StageContract] {
        &self.contracts
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    pub fn train(&self) {
        self.set_training(true);
    }

    pub fn eval(&self) {
        self.set_training(false);
    }

    fn trace_state(&self, state: PipelineState, features: &FeatureTensor) {
        debug!(
            ?state,
            batch = features.batch(),
            shape = ?features.item_shape(),
            "pipeline state"
        );
    }

    /// Wavelet attention repeats, quaternion fusion and windowed refinement
    /// over `(channels, tokens)` items.
    fn refine(
        &self,
        features: FeatureTensor,
        attention: &[WaveletAttention],
        fusion: &QuaternionFusion,
        stage: &dyn HierarchicalStage,
        states: [PipelineState; 3],
    ) -> PureResult<FeatureTensor> {
        let mut x = features;
        for block in attention {
            x = block.forward_batch(&x)?;
        }
        self.trace_state(states[0], &x);
        let x = x.map(|item| fusion.forward(item))?;
        self.trace_state(states[1], &x);
        let x = x.map(|item| stage.forward(item))?;
        self.trace_state(states[2], &x);
        Ok(x)
    }

    /// Scores every `(3, img_size, img_size)` image, one finite scalar each,
    /// in input order.
    pub fn forward(&self, images: &FeatureGrid) -> PureResult<Vec<f32>> {
        let side = self.config.img_size;
        check_image(images, IMAGE_CHANNELS, (side, side))?;

        let blocks = self.backbone.forward_blocks(images)?;
        debug!(
            state = ?PipelineState::BackboneForward,
            blocks = blocks.len(),
            "pipeline state"
        );
        let mut taps = TapCollector::new(self.config.tap_depths);
        taps.capture(blocks);
        let tokens = taps.extract()?;
        taps.reset();
        // (tokens, 4·W) rows become (4·W, tokens) channel maps
        let features = tokens.map(|item| Ok(item.transpose()))?;
        self.trace_state(PipelineState::FeatureExtracted, &features);

        let features = self.refine(
            features,
            &self.stage1_attention,
            &self.stage1_fusion,
            self.stage1_refine.as_ref(),
            [
                PipelineState::Stage1Attention,
                PipelineState::Stage1Fusion,
                PipelineState::Stage1Refine,
            ],
        )?;
        let features = self.refine(
            features,
            &self.stage2_attention,
            &self.stage2_fusion,
            self.stage2_refine.as_ref(),
            [
                PipelineState::Stage2Attention,
                PipelineState::Stage2Fusion,
                PipelineState::Stage2Refine,
            ],
        )?;

        let locations = features.map(|item| Ok(item.transpose()))?;
        let scores = self.head.pool(&locations)?;
        debug!(state = ?PipelineState::Pooled, batch = scores.len(), "pipeline state");
        if let Some(&bad) = scores.iter().find(|s| !s.is_finite()) {
            return Err(TensorError::NonFiniteValue {
                label: "pipeline.score",
                value: bad,
            });
        }
        Ok(scores)
    }
}

impl Module for QualityScoringPipeline {
    /// Scores a single `(3, img_size * img_size)` image as a `(1, 1)` tensor.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let side = self.config.img_size;
        let grid = FeatureGrid::from_items(vec![input.clone()], (side, side))?;
        let scores = QualityScoringPipeline::forward(self, &grid)?;
        Tensor::from_vec(1, 1, scores)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.backbone.visit_parameters(visitor)?;
        for block in &self.stage1_attention {
            block.visit_parameters(visitor)?;
        }
        self.stage1_fusion.visit_parameters(visitor)?;
        self.stage1_refine.visit_parameters(visitor)?;
        for block in &self.stage2_attention {
            block.visit_parameters(visitor)?;
        }
        self.stage2_fusion.visit_parameters(visitor)?;
        self.stage2_refine.visit_parameters(visitor)?;
        self.head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.backbone.visit_parameters_mut(visitor)?;
        for block in &mut self.stage1_attention {
            block.visit_parameters_mut(visitor)?;
        }
        self.stage1_fusion.visit_parameters_mut(visitor)?;
        self.stage1_refine.visit_parameters_mut(visitor)?;
        for block in &mut self.stage2_attention {
            block.visit_parameters_mut(visitor)?;
        }
        self.stage2_fusion.visit_parameters_mut(visitor)?;
        self.stage2_refine.visit_parameters_mut(visitor)?;
        self.head.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        // the backbone is frozen and stays in inference mode
        for block in self.stage1_attention.iter().chain(&self.stage2_attention) {
            block.set_training(training);
        }
        self.stage1_refine.set_training(training);
        self.stage2_refine.set_training(training);
        self.head.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            embed_dim: 16,
            patch_size: 4,
            img_size: 16,
            depths: vec![1],
            num_heads: vec![2],
            window_size: 2,
            dim_mlp: 16,
            num_tab: 1,
            backbone_depth: 4,
            backbone_heads: 2,
            backbone_mlp_ratio: 2,
            tap_depths: [0, 1, 2, 3],
            seed: Some(5),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn contracts_follow_the_channel_schedule() {
        let pipeline = QualityScoringPipeline::new(small_config()).unwrap();
        let channels: Vec<usize> = pipeline.contracts().iter().map(|c| c.channels).collect();
        assert_eq!(channels, vec![16, 64, 64, 16, 16, 16, 8, 8, 1]);
        assert!(pipeline.contracts()[..8].iter().all(|c| c.hw == (4, 4)));
        assert_eq!(pipeline.contracts()[8].state, PipelineState::Pooled);
    }

    #[test]
    fn scores_a_small_batch() {
        let pipeline = QualityScoringPipeline::new(small_config()).unwrap();
        pipeline.eval();
        let images = FeatureGrid::zeros(2, 3, (16, 16)).unwrap();
        let scores = pipeline.forward(&images).unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|s| s.is_finite()));
        assert_eq!(scores[0], scores[1]);
    }

    #[test]
    fn module_forward_matches_batch_forward() {
        let pipeline = QualityScoringPipeline::new(small_config()).unwrap();
        pipeline.eval();
        let image = Tensor::from_fn(3, 256, |c, p| ((c * 256 + p) as f32 * 0.01).sin().abs())
            .unwrap();
        let single = Module::forward(&pipeline, &image).unwrap();
        let grid = FeatureGrid::from_items(vec![image], (16, 16)).unwrap();
        assert_eq!(single.data()[0], pipeline.forward(&grid).unwrap()[0]);
    }

    #[test]
    fn state_dict_covers_every_component() {
        let pipeline = QualityScoringPipeline::new(small_config()).unwrap();
        let state = pipeline.state_dict().unwrap();
        for key in [
            "vit.cls_token",
            "tablock1.0.c_q::weight",
            "conv1::r_weight",
            "tablock2.0.c_v::bias",
            "conv2::k_weight",
            "head.fc_weight.3::weight",
        ] {
            assert!(state.contains_key(key), "missing {key}");
        }
    }
}
