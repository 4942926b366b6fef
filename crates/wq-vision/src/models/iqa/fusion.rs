// SPDX-License-Identifier: AGPL-3.0-or-later

use wq_nn::layers::{ConvDirection, Gelu, QuaternionConv2d};
use wq_nn::module::{Module, Parameter};
use wq_tensor::{PureResult, Tensor, TensorError};

/// Quaternion channel fusion: a quaternion convolution (or transposed
/// convolution) with an optional GELU.
///
/// Padding is `kernel / 2` forwards and `kernel / 2 - 1` transposed, so an
/// odd kernel with stride 1 keeps the spatial resolution.
#[derive(Debug)]
pub struct QuaternionFusion {
    conv: QuaternionConv2d,
    activation: Option<Gelu>,
}

impl QuaternionFusion {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        bias: bool,
        activation: bool,
        transpose: bool,
        input_hw: (usize, usize),
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let (padding, direction) = if transpose {
            if kernel < 2 {
                return Err(TensorError::configuration(
                    "fusion.kernel",
                    format!("transposed fusion needs a kernel of at least 2, got {kernel}"),
                ));
            }
            (kernel / 2 - 1, ConvDirection::Transpose)
        } else {
            (kernel / 2, ConvDirection::Forward)
        };
        let conv = QuaternionConv2d::new(
            name,
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
            bias,
            direction,
            seed,
        )?;
        Ok(Self {
            conv,
            activation: activation.then(Gelu::new),
        })
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        self.conv.output_hw()
    }
}

impl Module for QuaternionFusion {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let out = self.conv.forward(input)?;
        match &self.activation {
            Some(gelu) => gelu.forward(&out),
            None => Ok(out),
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointwise_fusion_shrinks_channels_and_keeps_resolution() {
        let fusion =
            QuaternionFusion::new("f", 32, 8, 1, 1, true, false, false, (7, 7), Some(1)).unwrap();
        assert_eq!(fusion.output_hw().unwrap(), (7, 7));
        let out = fusion.forward(&Tensor::full(32, 49, 0.25).unwrap()).unwrap();
        assert_eq!(out.shape(), (8, 49));
    }

    #[test]
    fn odd_kernels_keep_resolution() {
        for kernel in [3usize, 5] {
            let fusion =
                QuaternionFusion::new("f", 8, 8, kernel, 1, false, true, false, (6, 6), Some(2))
                    .unwrap();
            assert_eq!(fusion.output_hw().unwrap(), (6, 6));
        }
    }

    #[test]
    fn channel_counts_outside_quaternion_groups_fail() {
        for (cin, cout) in [(30usize, 8usize), (32, 6)] {
            let err = QuaternionFusion::new("f", cin, cout, 1, 1, true, false, false, (4, 4), None)
                .unwrap_err();
            assert!(matches!(err, TensorError::Configuration { .. }));
        }
    }

    #[test]
    fn transposed_fusion_doubles_resolution() {
        let fusion =
            QuaternionFusion::new("up", 8, 4, 4, 2, true, true, true, (5, 5), Some(3)).unwrap();
        assert_eq!(fusion.output_hw().unwrap(), (10, 10));
        assert!(QuaternionFusion::new("up", 8, 4, 1, 1, true, false, true, (5, 5), None).is_err());
    }
}
