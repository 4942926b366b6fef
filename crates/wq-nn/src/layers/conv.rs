// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Convolutions over `(channels, height * width)` feature maps.
//!
//! Both directions lower to one matrix product: the forward convolution
//! gathers patches with `im2col`, the transposed convolution scatters
//! `Wᵀ · x` back onto the enlarged grid with `col2im`.

use crate::module::{fan_in_bound, Module, Parameter};
use wq_tensor::{PureResult, Tensor, TensorError};

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

/// Spatial bookkeeping shared by every 2-D convolution flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvGeometry {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub input_hw: (usize, usize),
}

impl ConvGeometry {
    pub fn new(
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        Ok(Self {
            kernel,
            stride,
            padding,
            input_hw,
        })
    }

    /// Number of taps in one kernel window.
    pub fn kernel_area(&self) -> usize {
        self.kernel.0 * self.kernel.1
    }

    /// Output resolution of a forward convolution.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    /// Output resolution of a transposed convolution,
    /// `(in - 1) * stride - 2 * padding + kernel` per axis.
    pub fn transpose_output_hw(&self) -> PureResult<(usize, usize)> {
        let axis = |input: usize, stride: usize, pad: usize, k: usize| {
            ((input - 1) * stride + k).checked_sub(2 * pad).filter(|v| *v > 0)
        };
        let (h, w) = self.input_hw;
        match (
            axis(h, self.stride.0, self.padding.0, self.kernel.0),
            axis(w, self.stride.1, self.padding.1, self.kernel.1),
        ) {
            (Some(oh), Some(ow)) => Ok((oh, ow)),
            _ => Err(TensorError::InvalidDimensions {
                rows: h,
                cols: self.kernel.0.max(self.kernel.1),
            }),
        }
    }

    fn check_input(&self, input: &Tensor, channels: usize) -> PureResult<()> {
        let expected = (channels, self.input_hw.0 * self.input_hw.1);
        if input.shape() != expected {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: expected,
            });
        }
        Ok(())
    }

    /// Gathers every receptive field into a `(channels * kh * kw, oh * ow)` matrix.
    pub fn im2col(&self, input: &Tensor, channels: usize) -> PureResult<Tensor> {
        self.check_input(input, channels)?;
        let (oh, ow) = self.output_hw()?;
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let positions = oh * ow;
        let mut columns = vec![0.0f32; channels * kh * kw * positions];
        let src = input.data();
        for c in 0..channels {
            let plane = &src[c * h * w..(c + 1) * h * w];
            for ky in 0..kh {
                for kx in 0..kw {
                    let row = (c * kh + ky) * kw + kx;
                    let dst = &mut columns[row * positions..(row + 1) * positions];
                    for oy in 0..oh {
                        let iy = (oy * self.stride.0 + ky) as isize - pad_h;
                        if iy < 0 || iy >= h as isize {
                            continue;
                        }
                        for ox in 0..ow {
                            let ix = (ox * self.stride.1 + kx) as isize - pad_w;
                            if ix < 0 || ix >= w as isize {
                                continue;
                            }
                            dst[oy * ow + ox] = plane[iy as usize * w + ix as usize];
                        }
                    }
                }
            }
        }
        Tensor::from_vec(channels * kh * kw, positions, columns)
    }

    /// Scatters a `(channels * kh * kw, h * w)` matrix onto the transposed
    /// output grid, accumulating overlaps.
    pub fn col2im(&self, columns: &Tensor, channels: usize) -> PureResult<Tensor> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let expected = (channels * kh * kw, h * w);
        if columns.shape() != expected {
            return Err(TensorError::ShapeMismatch {
                left: columns.shape(),
                right: expected,
            });
        }
        let (oh, ow) = self.transpose_output_hw()?;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let mut out = vec![0.0f32; channels * oh * ow];
        for c in 0..channels {
            let plane = &mut out[c * oh * ow..(c + 1) * oh * ow];
            for ky in 0..kh {
                for kx in 0..kw {
                    let row = columns.row((c * kh + ky) * kw + kx);
                    for iy in 0..h {
                        let oy = (iy * self.stride.0 + ky) as isize - pad_h;
                        if oy < 0 || oy >= oh as isize {
                            continue;
                        }
                        for ix in 0..w {
                            let ox = (ix * self.stride.1 + kx) as isize - pad_w;
                            if ox < 0 || ox >= ow as isize {
                                continue;
                            }
                            plane[oy as usize * ow + ox as usize] += row[iy * w + ix];
                        }
                    }
                }
            }
        }
        Tensor::from_vec(channels, oh * ow, out)
    }
}

/// Forward convolution with a dense `(out, in * kh * kw)` kernel.
pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&[f32]>,
    geometry: &ConvGeometry,
) -> PureResult<Tensor> {
    let (out_channels, span) = weight.shape();
    let in_channels = span / geometry.kernel_area();
    let columns = geometry.im2col(input, in_channels)?;
    let mut out = weight.matmul(&columns)?;
    if let Some(bias) = bias {
        out.add_col_inplace(bias)?;
    }
    debug_assert_eq!(out.shape().0, out_channels);
    Ok(out)
}

/// Transposed convolution with a dense `(in, out * kh * kw)` kernel.
pub fn conv_transpose2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&[f32]>,
    geometry: &ConvGeometry,
) -> PureResult<Tensor> {
    let (in_channels, span) = weight.shape();
    let out_channels = span / geometry.kernel_area();
    geometry.check_input(input, in_channels)?;
    let columns = weight.transpose().matmul(input)?;
    let mut out = geometry.col2im(&columns, out_channels)?;
    if let Some(bias) = bias {
        out.add_col_inplace(bias)?;
    }
    Ok(out)
}

/// Two-dimensional convolution operating on `(channels, height * width)` tensors.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    geometry: ConvGeometry,
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        Self::with_seed(
            name,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_seed(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        let geometry = ConvGeometry::new(kernel, stride, padding, input_hw)?;
        geometry.output_hw()?;
        let name = name.into();
        let span = in_channels * geometry.kernel_area();
        let bound = fan_in_bound(span);
        Ok(Self {
            weight: Parameter::uniform(format!("{name}::weight"), out_channels, span, bound, seed)?,
            bias: Parameter::uniform(format!("{name}::bias"), 1, out_channels, bound, seed)?,
            in_channels,
            out_channels,
            geometry,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    /// Spatial size of the produced feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        self.geometry.output_hw()
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        conv2d(
            input,
            self.weight.value(),
            Some(self.bias.value().data()),
            &self.geometry,
        )
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)
    }
}
