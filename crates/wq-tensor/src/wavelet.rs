// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Single-level Haar low-pass used to build the wavelet view of token rows.
//!
//! The approximation band of a length `N` signal has `ceil(N / 2)`
//! coefficients (symmetric boundary extension). [`fit_length`] forces the band
//! back to exactly `N` so downstream projections keep their width; the tail of
//! the row is zero filled, which discards information on purpose.

use crate::feature::FeatureTensor;
use crate::pure::{PureResult, Tensor};
use rayon::prelude::*;
use std::f32::consts::FRAC_1_SQRT_2;
use wq_config::determinism;

const PARALLEL_ROW_THRESHOLD: usize = 1 << 14;

/// Approximation coefficients of one row.
pub fn haar_approximation(signal: &[f32]) -> Vec<f32> {
    let n = signal.len();
    let half = (n + 1) / 2;
    let mut coeffs = Vec::with_capacity(half);
    for i in 0..half {
        let a = signal[2 * i];
        // symmetric extension mirrors the last sample
        let b = signal.get(2 * i + 1).copied().unwrap_or(a);
        coeffs.push((a + b) * FRAC_1_SQRT_2);
    }
    coeffs
}

/// Zero pads or truncates `coeffs` to exactly `len` entries.
pub fn fit_length(mut coeffs: Vec<f32>, len: usize) -> Vec<f32> {
    coeffs.resize(len, 0.0);
    coeffs
}

fn lowpass_row(src: &[f32], dst: &mut [f32]) {
    let coeffs = fit_length(haar_approximation(src), dst.len());
    dst.copy_from_slice(&coeffs);
}

/// Runs the length-preserving Haar low-pass over every row of `tensor`.
pub fn haar_lowpass_rows(tensor: &Tensor) -> PureResult<Tensor> {
    let (rows, cols) = tensor.shape();
    let src = tensor.data();
    let mut out = vec![0.0f32; rows * cols];
    let parallel = rows > 1
        && rows * cols >= PARALLEL_ROW_THRESHOLD
        && !determinism::lock_reduction_order();
    if parallel {
        out.par_chunks_mut(cols)
            .zip(src.par_chunks(cols))
            .for_each(|(dst, row)| lowpass_row(row, dst));
    } else {
        out.chunks_mut(cols)
            .zip(src.chunks(cols))
            .for_each(|(dst, row)| lowpass_row(row, dst));
    }
    Tensor::from_vec(rows, cols, out)
}

/// Transforms every `(batch, channel)` row of `features` in one pass.
pub fn haar_lowpass(features: &FeatureTensor) -> PureResult<FeatureTensor> {
    let stacked = features.stack_rows()?;
    let transformed = haar_lowpass_rows(&stacked)?;
    FeatureTensor::unstack_rows(&transformed, features.batch())
}
