// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;

use tracing::debug;
use wq_nn::io;
use wq_nn::layers::{Conv2d, Gelu, LayerNorm, Linear, MultiHeadAttention};
use wq_nn::module::{Module, Parameter};
use wq_tensor::{FeatureGrid, FeatureTensor, PureResult, Tensor, TensorError};

use crate::models::utils::{check_image, conv_to_tokens, derive_layer_seed};

/// Frozen feature extractor whose intermediate block outputs can be tapped.
///
/// `forward_blocks` returns one entry per transformer block in execution
/// order; every entry holds `(tokens + 1, width)` items where row 0 is the
/// class token.
pub trait Backbone: Module {
    fn forward_blocks(&self, images: &FeatureGrid) -> PureResult<Vec<FeatureTensor>>;

    /// Per-block token width.
    fn width(&self) -> usize;

    /// Number of transformer blocks.
    fn depth(&self) -> usize;

    /// Patch grid the non-class tokens are laid out on.
    fn token_grid(&self) -> (usize, usize);
}

#[derive(Clone, Debug)]
pub struct ViTConfig {
    pub image_hw: (usize, usize),
    pub patch_size: usize,
    pub in_channels: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
    pub num_classes: usize,
    pub epsilon: f32,
    pub seed: Option<u64>,
}

impl Default for ViTConfig {
    fn default() -> Self {
        Self {
            image_hw: (224, 224),
            patch_size: 8,
            in_channels: 3,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4,
            num_classes: 1000,
            epsilon: 1.0e-6,
            seed: None,
        }
    }
}

#[derive(Debug)]
struct TransformerBlock {
    norm1: LayerNorm,
    attn: MultiHeadAttention,
    norm2: LayerNorm,
    fc1: Linear,
    activation: Gelu,
    fc2: Linear,
}

impl TransformerBlock {
    fn new(name: &str, config: &ViTConfig, seed: Option<u64>) -> PureResult<Self> {
        let dim = config.embed_dim;
        let hidden = dim * config.mlp_ratio;
        Ok(Self {
            norm1: LayerNorm::new(format!("{name}.norm1"), dim, config.epsilon)?,
            attn: MultiHeadAttention::with_seed(format!("{name}.attn"), dim, config.num_heads, seed)?,
            norm2: LayerNorm::new(format!("{name}.norm2"), dim, config.epsilon)?,
            fc1: Linear::with_seed(format!("{name}.mlp.fc1"), dim, hidden, seed)?,
            activation: Gelu::new(),
            fc2: Linear::with_seed(format!("{name}.mlp.fc2"), hidden, dim, seed)?,
        })
    }
}

impl Module for TransformerBlock {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let attn = self.attn.forward(&self.norm1.forward(input)?)?;
        let resid = input.add(&attn)?;
        let hidden = self.activation.forward(&self.fc1.forward(&self.norm2.forward(&resid)?)?)?;
        resid.add(&self.fc2.forward(&hidden)?)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm1.visit_parameters(visitor)?;
        self.attn.visit_parameters(visitor)?;
        self.norm2.visit_parameters(visitor)?;
        self.fc1.visit_parameters(visitor)?;
        self.fc2.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm1.visit_parameters_mut(visitor)?;
        self.attn.visit_parameters_mut(visitor)?;
        self.norm2.visit_parameters_mut(visitor)?;
        self.fc1.visit_parameters_mut(visitor)?;
        self.fc2.visit_parameters_mut(visitor)
    }
}

/// Vision transformer with a class token and learned position embedding.
#[derive(Debug)]
pub struct VisionTransformer {
    patch_embed: Conv2d,
    cls_token: Parameter,
    pos_embed: Parameter,
    blocks: Vec<TransformerBlock>,
    norm: LayerNorm,
    head: Linear,
    embed_dim: usize,
    in_channels: usize,
    image_hw: (usize, usize),
    patch_grid: (usize, usize),
}

impl VisionTransformer {
    pub fn new(config: ViTConfig) -> PureResult<Self> {
        let (h, w) = config.image_hw;
        let p = config.patch_size;
        if p == 0 || h == 0 || w == 0 || h % p != 0 || w % p != 0 {
            return Err(TensorError::configuration(
                "vit.patch_size",
                format!("{h}x{w} images cannot be tiled by {p}x{p} patches"),
            ));
        }
        if config.embed_dim == 0 || config.depth == 0 || config.mlp_ratio == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: config.depth,
                cols: config.embed_dim,
            });
        }
        let grid = (h / p, w / p);
        let seed = config.seed;
        let patch_embed = Conv2d::with_seed(
            "vit.patch_embed",
            config.in_channels,
            config.embed_dim,
            (p, p),
            (p, p),
            (0, 0),
            config.image_hw,
            derive_layer_seed(seed, "vit.patch_embed"),
        )?;
        let blocks = (0..config.depth)
            .map(|idx| {
                let name = format!("vit.blocks.{idx}");
                let block_seed = derive_layer_seed(seed, &name);
                TransformerBlock::new(&name, &config, block_seed)
            })
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self {
            patch_embed,
            cls_token: Parameter::normal("vit.cls_token", 1, config.embed_dim, 0.02, seed)?,
            pos_embed: Parameter::normal(
                "vit.pos_embed",
                grid.0 * grid.1 + 1,
                config.embed_dim,
                0.02,
                seed,
            )?,
            blocks,
            norm: LayerNorm::new("vit.norm", config.embed_dim, config.epsilon)?,
            head: Linear::with_seed("vit.head", config.embed_dim, config.num_classes.max(1), seed)?,
            embed_dim: config.embed_dim,
            in_channels: config.in_channels,
            image_hw: config.image_hw,
            patch_grid: grid,
        })
    }

    pub fn patches(&self) -> usize {
        self.patch_grid.0 * self.patch_grid.1
    }

    pub fn load_weights_json<P: AsRef<Path>>(&mut self, path: P) -> PureResult<()> {
        io::load_json(self, path)
    }

    pub fn load_weights_bincode<P: AsRef<Path>>(&mut self, path: P) -> PureResult<()> {
        io::load_bincode(self, path)
    }

    /// Patch embedding, class token and position embedding for one image.
    fn embed(&self, image: &Tensor) -> PureResult<Tensor> {
        let patches = self.patch_embed.forward(image)?;
        let tokens = conv_to_tokens(&patches, self.embed_dim, self.patch_grid)?;
        let tokens = Tensor::cat_rows(&[self.cls_token.value().clone(), tokens])?;
        tokens.add(self.pos_embed.value())
    }

    /// Runs every block over one image, returning each block's output.
    fn block_outputs(&self, image: &Tensor) -> PureResult<Vec<Tensor>> {
        let mut tokens = self.embed(image)?;
        let mut outputs = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            tokens = block.forward(&tokens)?;
            outputs.push(tokens.clone());
        }
        Ok(outputs)
    }
}

impl Backbone for VisionTransformer {
    fn forward_blocks(&self, images: &FeatureGrid) -> PureResult<Vec<FeatureTensor>> {
        check_image(images, self.in_channels, self.image_hw)?;
        debug!(batch = images.batch(), depth = self.blocks.len(), "vit forward");
        let mut per_block: Vec<Vec<Tensor>> = (0..self.blocks.len())
            .map(|_| Vec::with_capacity(images.batch()))
            .collect();
        for image in images.items() {
            for (slot, output) in per_block.iter_mut().zip(self.block_outputs(image)?) {
                slot.push(output);
            }
        }
        per_block.into_iter().map(FeatureTensor::new).collect()
    }

    fn width(&self) -> usize {
        self.embed_dim
    }

    fn depth(&self) -> usize {
        self.blocks.len()
    }

    fn token_grid(&self) -> (usize, usize) {
        self.patch_grid
    }
}

impl Module for VisionTransformer {
    /// Classifies one `(channels, height * width)` image from its class token.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut tokens = self.embed(input)?;
        for block in &self.blocks {
            tokens = block.forward(&tokens)?;
        }
        let cls = self.norm.forward(&tokens.slice_rows(0, 1)?)?;
        self.head.forward(&cls)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.patch_embed.visit_parameters(visitor)?;
        visitor(&self.cls_token)?;
        visitor(&self.pos_embed)?;
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        self.norm.visit_parameters(visitor)?;
        self.head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.patch_embed.visit_parameters_mut(visitor)?;
        visitor(&mut self.cls_token)?;
        visitor(&mut self.pos_embed)?;
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        self.norm.visit_parameters_mut(visitor)?;
        self.head.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> VisionTransformer {
        VisionTransformer::new(ViTConfig {
            image_hw: (16, 16),
            patch_size: 4,
            embed_dim: 8,
            depth: 3,
            num_heads: 2,
            mlp_ratio: 2,
            num_classes: 5,
            seed: Some(21),
            ..ViTConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn forward_blocks_returns_every_block_with_class_token() {
        let vit = tiny();
        let images = FeatureGrid::zeros(2, 3, (16, 16)).unwrap();
        let blocks = vit.forward_blocks(&images).unwrap();
        assert_eq!(blocks.len(), 3);
        for block in &blocks {
            assert_eq!(block.batch(), 2);
            assert_eq!(block.item_shape(), (17, 8));
        }
        assert_eq!(vit.token_grid(), (4, 4));
    }

    #[test]
    fn classifier_reads_the_class_token() {
        let vit = tiny();
        let image = Tensor::random_uniform(3, 256, 0.0, 1.0, Some(2)).unwrap();
        let logits = vit.forward(&image).unwrap();
        assert_eq!(logits.shape(), (1, 5));
        assert!(logits.is_finite());
    }

    #[test]
    fn untileable_images_are_rejected() {
        let err = VisionTransformer::new(ViTConfig {
            image_hw: (18, 16),
            patch_size: 4,
            ..ViTConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, TensorError::Configuration { .. }));
    }

    #[test]
    fn pretrained_weights_load_from_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let source = tiny();
        let image = Tensor::random_uniform(3, 256, 0.0, 1.0, Some(4)).unwrap();
        let mut target = VisionTransformer::new(ViTConfig {
            image_hw: (16, 16),
            patch_size: 4,
            embed_dim: 8,
            depth: 3,
            num_heads: 2,
            mlp_ratio: 2,
            num_classes: 5,
            seed: Some(22),
            ..ViTConfig::default()
        })
        .unwrap();

        let json = dir.path().join("vit.json");
        io::save_json(&source, &json).unwrap();
        target.load_weights_json(&json).unwrap();
        assert_eq!(target.forward(&image).unwrap(), source.forward(&image).unwrap());

        let bin = dir.path().join("vit.bin");
        io::save_bincode(&tiny(), &bin).unwrap();
        target.load_weights_bincode(&bin).unwrap();
        assert_eq!(target.forward(&image).unwrap(), source.forward(&image).unwrap());
    }

    #[test]
    fn wrong_image_geometry_is_a_shape_mismatch() {
        let vit = tiny();
        let images = FeatureGrid::zeros(1, 3, (8, 8)).unwrap();
        assert!(matches!(
            vit.forward_blocks(&images),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
