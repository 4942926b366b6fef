// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shifted-window transformer stage operating on `(channels, height * width)`
//! feature maps.
//!
//! A stage is a list of layers; each layer runs `depth` window-attention
//! blocks (alternating plain and half-window shifted partitions) followed by
//! a 3×3 convolution, and the stage adds `scale · layer(x)` back onto `x`.

use tracing::trace;
use wq_nn::layers::{Conv2d, Gelu, LayerNorm, Linear, MultiHeadAttention};
use wq_nn::module::{Module, Parameter};
use wq_tensor::{PureResult, Tensor, TensorError};

use crate::models::utils::{
    conv_to_tokens, derive_layer_seed, gather_rows, scatter_rows, tokens_to_conv,
};

/// Additive score applied between tokens from different shifted regions.
const SHIFT_MASK_VALUE: f32 = -100.0;

/// Refinement stage that maps a feature grid onto a grid of the same shape.
///
/// The scoring pipeline only relies on the declared channel width and
/// spatial resolution.
pub trait HierarchicalStage: Module {
    fn channels(&self) -> usize;
    fn resolution(&self) -> (usize, usize);
}

#[derive(Clone, Debug)]
pub struct SwinConfig {
    pub resolution: (usize, usize),
    pub embed_dim: usize,
    pub depths: Vec<usize>,
    pub num_heads: Vec<usize>,
    pub window_size: usize,
    pub dim_mlp: usize,
    pub scale: f32,
    pub epsilon: f32,
    pub seed: Option<u64>,
}

impl Default for SwinConfig {
    fn default() -> Self {
        Self {
            resolution: (28, 28),
            embed_dim: 72,
            depths: vec![2, 2],
            num_heads: vec![4, 4],
            window_size: 4,
            dim_mlp: 768,
            scale: 0.8,
            epsilon: 1.0e-5,
            seed: None,
        }
    }
}

/// Window partition of a `(height, width)` grid after a cyclic shift.
#[derive(Clone, Debug)]
struct WindowLayout {
    /// Token indices (into the unshifted grid) of every window, row-major.
    windows: Vec<Vec<usize>>,
    /// Per-window additive mask, present only for shifted layouts.
    masks: Option<Vec<Tensor>>,
}

impl WindowLayout {
    fn new(resolution: (usize, usize), window: usize, shift: usize) -> PureResult<Self> {
        let (h, w) = resolution;
        let region = |pos: usize, extent: usize| {
            if pos < extent - window {
                0
            } else if pos < extent - shift {
                1
            } else {
                2
            }
        };
        let mut windows = Vec::with_capacity((h / window) * (w / window));
        let mut labels = Vec::with_capacity(windows.capacity());
        for wy in 0..h / window {
            for wx in 0..w / window {
                let mut indices = Vec::with_capacity(window * window);
                let mut region_ids = Vec::with_capacity(window * window);
                for ty in 0..window {
                    for tx in 0..window {
                        let (sy, sx) = (wy * window + ty, wx * window + tx);
                        indices.push(((sy + shift) % h) * w + (sx + shift) % w);
                        region_ids.push(region(sy, h) * 3 + region(sx, w));
                    }
                }
                windows.push(indices);
                labels.push(region_ids);
            }
        }
        let masks = if shift > 0 {
            let n = window * window;
            let masks = labels
                .iter()
                .map(|ids| {
                    Tensor::from_fn(n, n, |i, j| {
                        if ids[i] == ids[j] {
                            0.0
                        } else {
                            SHIFT_MASK_VALUE
                        }
                    })
                })
                .collect::<PureResult<Vec<_>>>()?;
            Some(masks)
        } else {
            None
        };
        Ok(Self { windows, masks })
    }
}

/// Window attention with a learned relative position bias per head.
#[derive(Debug)]
struct WindowAttention {
    attn: MultiHeadAttention,
    bias_table: Parameter,
    relative_index: Vec<usize>,
    window: usize,
    heads: usize,
}

impl WindowAttention {
    fn new(
        name: &str,
        dim: usize,
        window: usize,
        heads: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let span = 2 * window - 1;
        let n = window * window;
        let mut relative_index = Vec::with_capacity(n * n);
        for i in 0..n {
            let (iy, ix) = (i / window, i % window);
            for j in 0..n {
                let (jy, jx) = (j / window, j % window);
                let dy = iy + window - 1 - jy;
                let dx = ix + window - 1 - jx;
                relative_index.push(dy * span + dx);
            }
        }
        Ok(Self {
            attn: MultiHeadAttention::with_seed(name, dim, heads, seed)?,
            bias_table: Parameter::normal(
                format!("{name}.relative_position_bias_table"),
                span * span,
                heads,
                0.02,
                seed,
            )?,
            relative_index,
            window,
            heads,
        })
    }

    /// Expands the bias table into one `(n, n)` score bias per head.
    fn head_bias(&self) -> PureResult<Vec<Tensor>> {
        let n = self.window * self.window;
        let table = self.bias_table.value();
        (0..self.heads)
            .map(|h| Tensor::from_fn(n, n, |i, j| table.row(self.relative_index[i * n + j])[h]))
            .collect()
    }
}

#[derive(Debug)]
struct SwinBlock {
    norm1: LayerNorm,
    attn: WindowAttention,
    norm2: LayerNorm,
    fc1: Linear,
    activation: Gelu,
    fc2: Linear,
    layout: WindowLayout,
}

impl SwinBlock {
    fn new(
        name: &str,
        config: &SwinConfig,
        heads: usize,
        window: usize,
        shift: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let dim = config.embed_dim;
        Ok(Self {
            norm1: LayerNorm::new(format!("{name}.norm1"), dim, config.epsilon)?,
            attn: WindowAttention::new(&format!("{name}.attn"), dim, window, heads, seed)?,
            norm2: LayerNorm::new(format!("{name}.norm2"), dim, config.epsilon)?,
            fc1: Linear::with_seed(format!("{name}.mlp.fc1"), dim, config.dim_mlp, seed)?,
            activation: Gelu::new(),
            fc2: Linear::with_seed(format!("{name}.mlp.fc2"), config.dim_mlp, dim, seed)?,
            layout: WindowLayout::new(config.resolution, window, shift)?,
        })
    }
}

impl Module for SwinBlock {
    /// Input and output are `(height * width, channels)` token rows.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let normed = self.norm1.forward(input)?;
        let bias = self.attn.head_bias()?;
        let mut attended = Tensor::zeros(input.shape().0, input.shape().1)?;
        for (index, window) in self.layout.windows.iter().enumerate() {
            let tokens = gather_rows(&normed, window)?;
            let mask = self.layout.masks.as_ref().map(|masks| &masks[index]);
            let out = self.attn.attn.forward_with_bias(&tokens, Some(&bias), mask)?;
            scatter_rows(&mut attended, window, &out)?;
        }
        let resid = input.add(&attended)?;
        let hidden = self
            .activation
            .forward(&self.fc1.forward(&self.norm2.forward(&resid)?)?)?;
        resid.add(&self.fc2.forward(&hidden)?)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm1.visit_parameters(visitor)?;
        self.attn.attn.visit_parameters(visitor)?;
        visitor(&self.attn.bias_table)?;
        self.norm2.visit_parameters(visitor)?;
        self.fc1.visit_parameters(visitor)?;
        self.fc2.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.norm1.visit_parameters_mut(visitor)?;
        self.attn.attn.visit_parameters_mut(visitor)?;
        visitor(&mut self.attn.bias_table)?;
        self.norm2.visit_parameters_mut(visitor)?;
        self.fc1.visit_parameters_mut(visitor)?;
        self.fc2.visit_parameters_mut(visitor)
    }
}

#[derive(Debug)]
struct SwinLayer {
    blocks: Vec<SwinBlock>,
    conv: Conv2d,
}

impl Module for SwinLayer {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut tokens = input.clone();
        for block in &self.blocks {
            tokens = block.forward(&tokens)?;
        }
        let channels = self.conv.in_channels();
        let hw = self.conv.geometry().input_hw;
        let map = self.conv.forward(&tokens_to_conv(&tokens, channels, hw)?)?;
        conv_to_tokens(&map, channels, hw)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        self.conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        self.conv.visit_parameters_mut(visitor)
    }
}

#[derive(Debug)]
pub struct SwinStage {
    layers: Vec<SwinLayer>,
    scale: f32,
    channels: usize,
    resolution: (usize, usize),
}

impl SwinStage {
    pub fn new(name: &str, config: SwinConfig) -> PureResult<Self> {
        let (h, w) = config.resolution;
        if config.depths.len() != config.num_heads.len() {
            return Err(TensorError::configuration(
                "swin.num_heads",
                format!(
                    "{} layer depths but {} head counts",
                    config.depths.len(),
                    config.num_heads.len()
                ),
            ));
        }
        if h == 0 || w == 0 || config.window_size == 0 {
            return Err(TensorError::InvalidDimensions { rows: h, cols: w });
        }
        // small grids collapse to a single unshifted window
        let (window, shift) = if h.min(w) <= config.window_size {
            (h.min(w), 0)
        } else {
            (config.window_size, config.window_size / 2)
        };
        if h % window != 0 || w % window != 0 {
            return Err(TensorError::configuration(
                "swin.window_size",
                format!("{h}x{w} grid cannot be tiled by {window}x{window} windows"),
            ));
        }
        let mut layers = Vec::with_capacity(config.depths.len());
        for (layer_idx, (&depth, &heads)) in
            config.depths.iter().zip(&config.num_heads).enumerate()
        {
            let layer_name = format!("{name}.layers.{layer_idx}");
            let blocks = (0..depth)
                .map(|block_idx| {
                    let block_name = format!("{layer_name}.blocks.{block_idx}");
                    let block_shift = if block_idx % 2 == 0 { 0 } else { shift };
                    SwinBlock::new(
                        &block_name,
                        &config,
                        heads,
                        window,
                        block_shift,
                        derive_layer_seed(config.seed, &block_name),
                    )
                })
                .collect::<PureResult<Vec<_>>>()?;
            let conv_name = format!("{layer_name}.conv");
            let conv = Conv2d::with_seed(
                conv_name.as_str(),
                config.embed_dim,
                config.embed_dim,
                (3, 3),
                (1, 1),
                (1, 1),
                config.resolution,
                derive_layer_seed(config.seed, &conv_name),
            )?;
            layers.push(SwinLayer { blocks, conv });
        }
        Ok(Self {
            layers,
            scale: config.scale,
            channels: config.embed_dim,
            resolution: config.resolution,
        })
    }
}

impl HierarchicalStage for SwinStage {
    fn channels(&self) -> usize {
        self.channels
    }

    fn resolution(&self) -> (usize, usize) {
        self.resolution
    }
}

impl Module for SwinStage {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        trace!(layers = self.layers.len(), "swin stage");
        let mut tokens = conv_to_tokens(input, self.channels, self.resolution)?;
        for layer in &self.layers {
            let refined = layer.forward(&tokens)?.scale(self.scale)?;
            tokens = refined.add(&tokens)?;
        }
        tokens_to_conv(&tokens, self.channels, self.resolution)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}
