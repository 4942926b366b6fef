// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Quaternion-valued kernels.
//!
//! Channels are split into four equal groups `(r, i, j, k)`. A kernel stores
//! one real component per group and expands into a dense real kernel whose
//! block structure is the left Hamilton product `W ⊗ x`:
//!
//! ```text
//! | r -i -j -k |
//! | i  r -k  j |
//! | j  k  r -i |
//! | k -j  i  r |
//! ```

use crate::pure::{PureResult, Tensor, TensorError};

/// Checks that `channels` splits into four quaternion groups.
pub fn ensure_quaternion_channels(label: &'static str, channels: usize) -> PureResult<()> {
    if channels == 0 || channels % 4 != 0 {
        return Err(TensorError::configuration(
            label,
            format!("{channels} channels cannot be split into quaternion groups of 4"),
        ));
    }
    Ok(())
}

/// Hamilton product `p ⊗ q` of two quaternions written as `[r, i, j, k]`.
pub fn hamilton_product(p: [f32; 4], q: [f32; 4]) -> [f32; 4] {
    let [a1, b1, c1, d1] = p;
    let [a2, b2, c2, d2] = q;
    [
        a1 * a2 - b1 * b2 - c1 * c2 - d1 * d2,
        a1 * b2 + b1 * a2 + c1 * d2 - d1 * c2,
        a1 * c2 - b1 * d2 + c1 * a2 + d1 * b2,
        a1 * d2 + b1 * c2 - c1 * b2 + d1 * a2,
    ]
}

/// The four real components of a quaternion convolution kernel.
///
/// Each component has shape `(rows / 4, cols / 4)` of the expanded kernel;
/// for a forward convolution that is `(out / 4, in / 4 * kh * kw)`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuaternionKernel {
    pub r: Tensor,
    pub i: Tensor,
    pub j: Tensor,
    pub k: Tensor,
}

impl QuaternionKernel {
    pub fn new(r: Tensor, i: Tensor, j: Tensor, k: Tensor) -> PureResult<Self> {
        let shape = r.shape();
        for other in [&i, &j, &k] {
            if other.shape() != shape {
                return Err(TensorError::ShapeMismatch {
                    left: shape,
                    right: other.shape(),
                });
            }
        }
        Ok(Self { r, i, j, k })
    }

    /// Component shape shared by `r`, `i`, `j` and `k`.
    pub fn component_shape(&self) -> (usize, usize) {
        self.r.shape()
    }

    /// Shape of the expanded real kernel.
    pub fn expanded_shape(&self) -> (usize, usize) {
        let (rows, cols) = self.component_shape();
        (rows * 4, cols * 4)
    }

    /// Assembles the dense real kernel from the Hamilton block layout.
    ///
    /// Column block `b` multiplies input group `b`; with components laid out
    /// `(channel, kh * kw)` the result is row-major `(out, in * kh * kw)`.
    pub fn hamilton_matrix(&self) -> PureResult<Tensor> {
        let neg_i = self.i.scale(-1.0)?;
        let neg_j = self.j.scale(-1.0)?;
        let neg_k = self.k.scale(-1.0)?;
        let rows = [
            [&self.r, &neg_i, &neg_j, &neg_k],
            [&self.i, &self.r, &neg_k, &self.j],
            [&self.j, &self.k, &self.r, &neg_i],
            [&self.k, &neg_j, &self.i, &self.r],
        ];
        let blocks = rows
            .iter()
            .map(|row| {
                let parts: Vec<Tensor> = row.iter().map(|t| (*t).clone()).collect();
                Tensor::cat_cols(&parts)
            })
            .collect::<PureResult<Vec<_>>>()?;
        Tensor::cat_rows(&blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(v: f32) -> Tensor {
        Tensor::from_vec(1, 1, vec![v]).unwrap()
    }

    #[test]
    fn channel_counts_must_split_into_four_groups() {
        assert!(ensure_quaternion_channels("test", 8).is_ok());
        for bad in [0usize, 3, 6, 10] {
            assert!(matches!(
                ensure_quaternion_channels("test", bad),
                Err(TensorError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn hamilton_product_follows_unit_rules() {
        let i = [0.0, 1.0, 0.0, 0.0];
        let j = [0.0, 0.0, 1.0, 0.0];
        let k = [0.0, 0.0, 0.0, 1.0];
        assert_eq!(hamilton_product(i, j), k);
        assert_eq!(hamilton_product(j, i), [0.0, 0.0, 0.0, -1.0]);
        assert_eq!(hamilton_product(i, i), [-1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn expanded_kernel_applies_left_hamilton_product() {
        let w = [0.5f32, -1.25, 2.0, 0.75];
        let x = [1.5f32, 0.25, -0.5, 3.0];
        let kernel =
            QuaternionKernel::new(scalar(w[0]), scalar(w[1]), scalar(w[2]), scalar(w[3])).unwrap();
        let matrix = kernel.hamilton_matrix().unwrap();
        assert_eq!(matrix.shape(), kernel.expanded_shape());
        let column = Tensor::from_vec(4, 1, x.to_vec()).unwrap();
        let out = matrix.matmul(&column).unwrap();
        let expected = hamilton_product(w, x);
        for (got, want) in out.data().iter().zip(expected) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn components_must_share_a_shape() {
        let a = Tensor::zeros(1, 2).unwrap();
        let b = Tensor::zeros(2, 1).unwrap();
        assert!(QuaternionKernel::new(a.clone(), a.clone(), a, b).is_err());
    }
}
