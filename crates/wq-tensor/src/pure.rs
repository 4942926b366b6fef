// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense row-major tensors and the error vocabulary shared by every WaveQ crate.

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use wq_config::determinism;

/// Result alias used across the tensor, module and vision layers.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor construction, layer wiring and data loading.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    #[error("invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero")]
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("shape mismatch: left={left:?}, right={right:?} cannot be combined")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input which would otherwise trigger a panic.
    #[error("{0} must not be empty for this computation")]
    EmptyInput(&'static str),
    /// Generic value violation for scalar hyper-parameters.
    #[error("invalid value supplied for {label}")]
    InvalidValue { label: &'static str },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    #[error("non-finite value {value} detected in {label}")]
    NonFiniteValue { label: &'static str, value: f32 },
    /// A structural contract (channel divisibility, stage widths, tap depths)
    /// was violated while building or driving a model.
    #[error("configuration error in {label}: {message}")]
    Configuration { label: &'static str, message: String },
    /// Attempted to load or update a parameter that was missing from the state dict.
    #[error("parameter {name} missing from state dict")]
    MissingParameter { name: String },
    /// A sample image could not be opened or decoded.
    #[error("failed to load {}: {message}", path.display())]
    DataIo { path: PathBuf, message: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    #[error("i/o error: {message}")]
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl TensorError {
    /// Shorthand for [`TensorError::Configuration`].
    pub fn configuration(label: &'static str, message: impl Into<String>) -> Self {
        TensorError::Configuration {
            label,
            message: message.into(),
        }
    }
}

const PARALLEL_GEMM_THRESHOLD: usize = 1 << 15;

fn should_parallelize(rows: usize, inner: usize, cols: usize) -> bool {
    if rows < 2 || rayon::current_num_threads() <= 1 || determinism::lock_reduction_order() {
        return false;
    }
    rows.saturating_mul(inner).saturating_mul(cols) >= PARALLEL_GEMM_THRESHOLD
}

/// A simple 2D tensor backed by a reference-counted row-major buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn from_parts(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            rows,
            cols,
        })
    }

    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor where every element equals `value`.
    pub fn full(rows: usize, cols: usize, value: f32) -> PureResult<Self> {
        Self::from_parts(rows, cols, vec![value; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// and benchmarks reproducible. Otherwise entropy from the host is used.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed, "wq-tensor/tensor/uniform");
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols)
            .map(|_| distribution.sample(&mut rng))
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng = Self::seedable_rng(seed, "wq-tensor/tensor/normal");
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(&mut rng);
                mean + std * sample as f32
            })
            .collect();
        Self::from_parts(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_parts(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements stored in the tensor.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Tensors can never be empty; kept for clippy parity with `len`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a read-only view of the row-major buffer.
    pub fn data(&self) -> &[f32] {
        self.data.as_slice()
    }

    /// Returns a mutable view of the buffer, cloning it if it is shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Returns a single row as a slice.
    pub fn row(&self, index: usize) -> &[f32] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// Returns true when every element is finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|value| value.is_finite())
    }

    /// Matrix multiply (`self @ other`).
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let mut out = vec![0.0f32; rows * cols];
        let lhs = self.data();
        let rhs = other.data();
        let kernel = |(row, dst): (usize, &mut [f32])| {
            let lhs_row = &lhs[row * inner..(row + 1) * inner];
            for (k, &scale) in lhs_row.iter().enumerate() {
                let rhs_row = &rhs[k * cols..(k + 1) * cols];
                for (acc, &value) in dst.iter_mut().zip(rhs_row) {
                    *acc += scale * value;
                }
            }
        };
        if should_parallelize(rows, inner, cols) {
            out.par_chunks_mut(cols).enumerate().for_each(kernel);
        } else {
            out.chunks_mut(cols).enumerate().for_each(kernel);
        }
        Tensor::from_parts(rows, cols, out)
    }

    /// Matrix multiply against the transpose of `other` (`self @ otherᵀ`)
    /// without materialising the transpose.
    pub fn matmul_transposed(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.cols {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (other.cols, other.rows),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.rows);
        let mut out = vec![0.0f32; rows * cols];
        let lhs = self.data();
        let rhs = other.data();
        let kernel = |(row, dst): (usize, &mut [f32])| {
            let lhs_row = &lhs[row * inner..(row + 1) * inner];
            for (col, acc) in dst.iter_mut().enumerate() {
                let rhs_row = &rhs[col * inner..(col + 1) * inner];
                *acc = lhs_row.iter().zip(rhs_row).map(|(a, b)| a * b).sum();
            }
        };
        if should_parallelize(rows, inner, cols) {
            out.par_chunks_mut(cols).enumerate().for_each(kernel);
        } else {
            out.chunks_mut(cols).enumerate().for_each(kernel);
        }
        Tensor::from_parts(rows, cols, out)
    }

    /// Row-wise softmax with max subtraction for numerical stability.
    pub fn row_softmax(&self) -> PureResult<Tensor> {
        let cols = self.cols;
        let mut out = self.data.as_ref().clone();
        for row in out.chunks_mut(cols) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for value in row.iter_mut() {
                *value = (*value - max).exp();
                sum += *value;
            }
            let inv = 1.0 / sum;
            for value in row.iter_mut() {
                *value *= inv;
            }
        }
        Tensor::from_parts(self.rows, cols, out)
    }

    fn zip_with(&self, other: &Tensor, op: impl Fn(f32, f32) -> f32) -> PureResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| op(a, b))
            .collect();
        Tensor::from_parts(self.rows, self.cols, data)
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Element-wise product (Hadamard) between two tensors of identical shape.
    pub fn hadamard(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Returns a new tensor where every element is scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        self.map(|a| a * value)
    }

    /// Returns a new tensor with `f` applied to every element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|&a| f(a)).collect();
        Tensor::from_parts(self.rows, self.cols, data)
    }

    /// Add a scaled tensor to this tensor (`self += scale * other`).
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = Arc::make_mut(&mut self.data);
        for (a, b) in data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for row in data.chunks_mut(cols) {
            for (value, b) in row.iter_mut().zip(bias) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Add the provided column vector to every column (`self[row][..] += bias[row]`).
    pub fn add_col_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.rows {
            return Err(TensorError::DataLength {
                expected: self.rows,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for (row, b) in data.chunks_mut(cols).zip(bias) {
            for value in row.iter_mut() {
                *value += b;
            }
        }
        Ok(())
    }

    /// Apply the ReLU activation in-place (`self[i] = max(self[i], 0)`).
    pub fn relu_inplace(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        for value in data.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
            }
        }
    }

    /// Apply the GELU activation in-place (`self[i] = GELU(self[i])`).
    pub fn gelu_inplace(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        for value in data.iter_mut() {
            *value = gelu(*value);
        }
    }

    /// Apply the logistic sigmoid in-place.
    pub fn sigmoid_inplace(&mut self) {
        let data = Arc::make_mut(&mut self.data);
        for value in data.iter_mut() {
            *value = sigmoid(*value);
        }
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data: Arc::new(data),
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns a reshaped tensor sharing the same buffer when the requested
    /// dimensions are compatible.
    pub fn reshape(&self, rows: usize, cols: usize) -> PureResult<Tensor> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if rows * cols != self.len() {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: self.len(),
            });
        }
        Ok(Tensor {
            data: Arc::clone(&self.data),
            rows,
            cols,
        })
    }

    /// Returns the sum over columns for each row.
    pub fn sum_axis1(&self) -> Vec<f32> {
        self.data
            .chunks(self.cols)
            .map(|row| row.iter().sum())
            .collect()
    }

    /// Sum of every element.
    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Copies rows `[start, end)` into a new tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.rows {
            return Err(TensorError::InvalidDimensions {
                rows: end.saturating_sub(start),
                cols: self.cols,
            });
        }
        let data = self.data[start * self.cols..end * self.cols].to_vec();
        Tensor::from_parts(end - start, self.cols, data)
    }

    /// Copies columns `[start, end)` into a new tensor.
    pub fn slice_cols(&self, start: usize, end: usize) -> PureResult<Tensor> {
        if start >= end || end > self.cols {
            return Err(TensorError::InvalidDimensions {
                rows: self.rows,
                cols: end.saturating_sub(start),
            });
        }
        let mut data = Vec::with_capacity(self.rows * (end - start));
        for row in self.data.chunks(self.cols) {
            data.extend_from_slice(&row[start..end]);
        }
        Tensor::from_parts(self.rows, end - start, data)
    }

    /// Concatenates tensors row-wise producing a new tensor whose row count is the sum
    /// of the inputs while preserving the shared column dimension.
    pub fn cat_rows(tensors: &[Tensor]) -> PureResult<Tensor> {
        let Some(first) = tensors.first() else {
            return Err(TensorError::EmptyInput("Tensor::cat_rows"));
        };
        let cols = first.cols;
        let mut total_rows = 0usize;
        for tensor in tensors {
            if tensor.cols != cols {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (tensor.rows, cols),
                });
            }
            total_rows += tensor.rows;
        }
        let mut data = Vec::with_capacity(total_rows * cols);
        for tensor in tensors {
            data.extend_from_slice(tensor.data());
        }
        Tensor::from_parts(total_rows, cols, data)
    }

    /// Concatenates tensors column-wise; every input must share the row count.
    pub fn cat_cols(tensors: &[Tensor]) -> PureResult<Tensor> {
        let Some(first) = tensors.first() else {
            return Err(TensorError::EmptyInput("Tensor::cat_cols"));
        };
        let rows = first.rows;
        let mut total_cols = 0usize;
        for tensor in tensors {
            if tensor.rows != rows {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (rows, tensor.cols),
                });
            }
            total_cols += tensor.cols;
        }
        let mut data = Vec::with_capacity(rows * total_cols);
        for r in 0..rows {
            for tensor in tensors {
                data.extend_from_slice(tensor.row(r));
            }
        }
        Tensor::from_parts(rows, total_cols, data)
    }
}

/// Gaussian error linear unit in its exact `erf` form.
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2))
}

/// Logistic sigmoid, split by sign so large magnitudes never overflow `exp`.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
