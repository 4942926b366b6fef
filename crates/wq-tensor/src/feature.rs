// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Batched views built from per-item [`Tensor`]s.
//!
//! A [`FeatureTensor`] is a `(batch, rows, cols)` stack where every item shares
//! one shape. A [`FeatureGrid`] adds a spatial `(height, width)` so each item
//! reads as `(channels, height * width)`.

use crate::pure::{PureResult, Tensor, TensorError};

/// Rank-3 tensor stored as one 2-D tensor per batch item.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureTensor {
    items: Vec<Tensor>,
}

impl FeatureTensor {
    /// Builds a batch, rejecting empty batches and items whose shapes disagree.
    pub fn new(items: Vec<Tensor>) -> PureResult<Self> {
        let Some(first) = items.first() else {
            return Err(TensorError::EmptyInput("FeatureTensor::new"));
        };
        let shape = first.shape();
        for item in &items[1..] {
            if item.shape() != shape {
                return Err(TensorError::ShapeMismatch {
                    left: shape,
                    right: item.shape(),
                });
            }
        }
        Ok(Self { items })
    }

    /// Wraps a single tensor as a batch of one.
    pub fn single(item: Tensor) -> Self {
        Self { items: vec![item] }
    }

    pub fn batch(&self) -> usize {
        self.items.len()
    }

    /// Shared `(rows, cols)` of every item.
    pub fn item_shape(&self) -> (usize, usize) {
        self.items[0].shape()
    }

    pub fn items(&self) -> &[Tensor] {
        &self.items
    }

    pub fn item(&self, index: usize) -> Option<&Tensor> {
        self.items.get(index)
    }

    pub fn into_items(self) -> Vec<Tensor> {
        self.items
    }

    /// Applies `f` to every item and re-validates the resulting batch.
    pub fn map<F>(&self, mut f: F) -> PureResult<FeatureTensor>
    where
        F: FnMut(&Tensor) -> PureResult<Tensor>,
    {
        let items = self.items.iter().map(&mut f).collect::<PureResult<Vec<_>>>()?;
        FeatureTensor::new(items)
    }

    /// Element-wise sum of two batches with identical shapes.
    pub fn add(&self, other: &FeatureTensor) -> PureResult<FeatureTensor> {
        if self.batch() != other.batch() {
            return Err(TensorError::ShapeMismatch {
                left: (self.batch(), self.item_shape().0),
                right: (other.batch(), other.item_shape().0),
            });
        }
        let items = self
            .items
            .iter()
            .zip(&other.items)
            .map(|(a, b)| a.add(b))
            .collect::<PureResult<Vec<_>>>()?;
        FeatureTensor::new(items)
    }

    /// Stacks every item into one `(batch * rows, cols)` tensor.
    pub fn stack_rows(&self) -> PureResult<Tensor> {
        Tensor::cat_rows(&self.items)
    }

    /// Splits a `(batch * rows, cols)` tensor produced by [`Self::stack_rows`].
    pub fn unstack_rows(stacked: &Tensor, batch: usize) -> PureResult<FeatureTensor> {
        let (rows, cols) = stacked.shape();
        if batch == 0 || rows % batch != 0 {
            return Err(TensorError::InvalidDimensions { rows: batch, cols });
        }
        let per_item = rows / batch;
        let items = (0..batch)
            .map(|b| stacked.slice_rows(b * per_item, (b + 1) * per_item))
            .collect::<PureResult<Vec<_>>>()?;
        FeatureTensor::new(items)
    }
}

/// Rank-4 `(batch, channels, height, width)` view over a [`FeatureTensor`].
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureGrid {
    features: FeatureTensor,
    hw: (usize, usize),
}

impl FeatureGrid {
    pub fn new(features: FeatureTensor, hw: (usize, usize)) -> PureResult<Self> {
        let (_, cols) = features.item_shape();
        if hw.0 == 0 || hw.1 == 0 || hw.0 * hw.1 != cols {
            return Err(TensorError::DataLength {
                expected: hw.0 * hw.1,
                got: cols,
            });
        }
        Ok(Self { features, hw })
    }

    pub fn from_items(items: Vec<Tensor>, hw: (usize, usize)) -> PureResult<Self> {
        Self::new(FeatureTensor::new(items)?, hw)
    }

    /// Builds a zero grid of the requested geometry.
    pub fn zeros(batch: usize, channels: usize, hw: (usize, usize)) -> PureResult<Self> {
        let items = (0..batch)
            .map(|_| Tensor::zeros(channels, hw.0 * hw.1))
            .collect::<PureResult<Vec<_>>>()?;
        Self::from_items(items, hw)
    }

    pub fn batch(&self) -> usize {
        self.features.batch()
    }

    pub fn channels(&self) -> usize {
        self.features.item_shape().0
    }

    pub fn hw(&self) -> (usize, usize) {
        self.hw
    }

    pub fn features(&self) -> &FeatureTensor {
        &self.features
    }

    pub fn into_features(self) -> FeatureTensor {
        self.features
    }

    pub fn items(&self) -> &[Tensor] {
        self.features.items()
    }

    /// Transposes every item to `(height * width, channels)` token rows.
    pub fn to_tokens(&self) -> PureResult<FeatureTensor> {
        self.features.map(|item| Ok(item.transpose()))
    }

    /// Inverse of [`Self::to_tokens`].
    pub fn from_tokens(tokens: &FeatureTensor, hw: (usize, usize)) -> PureResult<Self> {
        let (rows, _) = tokens.item_shape();
        if rows != hw.0 * hw.1 {
            return Err(TensorError::DataLength {
                expected: hw.0 * hw.1,
                got: rows,
            });
        }
        Self::new(tokens.map(|item| Ok(item.transpose()))?, hw)
    }
}
