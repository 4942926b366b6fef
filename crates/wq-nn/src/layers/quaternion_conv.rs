// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Quaternion-valued 2-D convolution.
//!
//! The layer owns four real component kernels and expands them into a dense
//! kernel through [`QuaternionKernel::hamilton_matrix`] on every call, so the
//! parameter count is a quarter of an equivalent real convolution.

use super::conv::{conv2d, conv_transpose2d, ConvGeometry};
use crate::module::{fan_in_bound, Module, Parameter};
use wq_tensor::quaternion::ensure_quaternion_channels;
use wq_tensor::{PureResult, QuaternionKernel, Tensor};

/// Direction of a [`QuaternionConv2d`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvDirection {
    Forward,
    Transpose,
}

#[derive(Debug)]
pub struct QuaternionConv2d {
    r: Parameter,
    i: Parameter,
    j: Parameter,
    k: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    geometry: ConvGeometry,
    direction: ConvDirection,
}

impl QuaternionConv2d {
    /// Builds a quaternion convolution over square kernels.
    ///
    /// Fails with a configuration error when either channel count is not a
    /// multiple of four.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        input_hw: (usize, usize),
        bias: bool,
        direction: ConvDirection,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        ensure_quaternion_channels("quaternion_conv.in_channels", in_channels)?;
        ensure_quaternion_channels("quaternion_conv.out_channels", out_channels)?;
        let geometry = ConvGeometry::new(
            (kernel, kernel),
            (stride, stride),
            (padding, padding),
            input_hw,
        )?;
        match direction {
            ConvDirection::Forward => geometry.output_hw()?,
            ConvDirection::Transpose => geometry.transpose_output_hw()?,
        };
        let area = geometry.kernel_area();
        // component rows index the side the kernel writes from
        let (rows, cols) = match direction {
            ConvDirection::Forward => (out_channels / 4, in_channels / 4 * area),
            ConvDirection::Transpose => (in_channels / 4, out_channels / 4 * area),
        };
        let name = name.into();
        let bound = fan_in_bound(in_channels * area);
        let component = |part: &str| {
            Parameter::uniform(format!("{name}::{part}_weight"), rows, cols, bound, seed)
        };
        let bias = if bias {
            Some(Parameter::uniform(
                format!("{name}::bias"),
                1,
                out_channels,
                bound,
                seed,
            )?)
        } else {
            None
        };
        Ok(Self {
            r: component("r")?,
            i: component("i")?,
            j: component("j")?,
            k: component("k")?,
            bias,
            in_channels,
            out_channels,
            geometry,
            direction,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn direction(&self) -> ConvDirection {
        self.direction
    }

    /// Spatial size of the produced feature map.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        match self.direction {
            ConvDirection::Forward => self.geometry.output_hw(),
            ConvDirection::Transpose => self.geometry.transpose_output_hw(),
        }
    }

    /// Snapshot of the four component kernels.
    pub fn kernel(&self) -> PureResult<QuaternionKernel> {
        QuaternionKernel::new(
            self.r.value().clone(),
            self.i.value().clone(),
            self.j.value().clone(),
            self.k.value().clone(),
        )
    }
}

impl Module for QuaternionConv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let weight = self.kernel()?.hamilton_matrix()?;
        let bias = self.bias.as_ref().map(|b| b.value().data());
        match self.direction {
            ConvDirection::Forward => conv2d(input, &weight, bias, &self.geometry),
            ConvDirection::Transpose => conv_transpose2d(input, &weight, bias, &self.geometry),
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for part in [&self.r, &self.i, &self.j, &self.k] {
            visitor(part)?;
        }
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for part in [&mut self.r, &mut self.i, &mut self.j, &mut self.k] {
            visitor(part)?;
        }
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wq_tensor::quaternion::hamilton_product;
    use wq_tensor::TensorError;

    #[test]
    fn rejects_channels_outside_quaternion_groups() {
        for (cin, cout) in [(6usize, 4usize), (8, 10)] {
            let err = QuaternionConv2d::new(
                "q",
                cin,
                cout,
                1,
                1,
                0,
                (4, 4),
                true,
                ConvDirection::Forward,
                Some(1),
            )
            .unwrap_err();
            assert!(matches!(err, TensorError::Configuration { .. }));
        }
    }

    #[test]
    fn pointwise_kernel_acts_as_hamilton_product_per_pixel() {
        let conv = QuaternionConv2d::new(
            "q",
            4,
            4,
            1,
            1,
            0,
            (2, 2),
            false,
            ConvDirection::Forward,
            Some(3),
        )
        .unwrap();
        assert_eq!(conv.parameter_count().unwrap(), 4);
        let input = Tensor::from_fn(4, 4, |c, p| (c as f32 + 1.0) * (p as f32 - 1.5)).unwrap();
        let out = conv.forward(&input).unwrap();
        let kernel = conv.kernel().unwrap();
        let w = [
            kernel.r.data()[0],
            kernel.i.data()[0],
            kernel.j.data()[0],
            kernel.k.data()[0],
        ];
        for p in 0..4 {
            let x = [0, 1, 2, 3].map(|c| input.data()[c * 4 + p]);
            let expected = hamilton_product(w, x);
            for c in 0..4 {
                assert!((out.data()[c * 4 + p] - expected[c]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn odd_kernels_with_half_padding_keep_resolution() {
        let conv = QuaternionConv2d::new(
            "q",
            8,
            4,
            3,
            1,
            1,
            (5, 5),
            true,
            ConvDirection::Forward,
            Some(2),
        )
        .unwrap();
        let out = conv.forward(&Tensor::zeros(8, 25).unwrap()).unwrap();
        assert_eq!(out.shape(), (4, 25));
    }

    #[test]
    fn transpose_direction_upsamples() {
        let conv = QuaternionConv2d::new(
            "qt",
            8,
            4,
            4,
            2,
            1,
            (3, 3),
            true,
            ConvDirection::Transpose,
            Some(4),
        )
        .unwrap();
        assert_eq!(conv.output_hw().unwrap(), (6, 6));
        let out = conv.forward(&Tensor::full(8, 9, 0.5).unwrap()).unwrap();
        assert_eq!(out.shape(), (4, 36));
        assert!(out.is_finite());
    }
}
