// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use wq_tensor::{PureResult, Tensor};

/// Gaussian Error Linear Unit, `x * Φ(x)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gelu;

impl Gelu {
    pub fn new() -> Self {
        Self
    }
}

impl Module for Gelu {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut out = input.clone();
        out.gelu_inplace();
        Ok(out)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gelu_matches_reference_points() {
        let input = Tensor::from_vec(1, 4, vec![-1.0, 0.0, 1.0, 3.0]).unwrap();
        let output = Gelu::new().forward(&input).unwrap();
        // erf form; the tanh approximation gives -0.158808 and 2.996363
        let expected = [-0.158_655, 0.0, 0.841_345, 2.995_950];
        for (out, exp) in output.data().iter().zip(expected) {
            assert!((out - exp).abs() < 2e-5, "{out} vs {exp}");
        }
    }
}
