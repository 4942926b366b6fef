// SPDX-License-Identifier: AGPL-3.0-or-later

use wq_config::determinism;
use wq_tensor::{FeatureGrid, PureResult, Tensor, TensorError};

/// Splits a model-wide seed into an independent seed per named sub-layer.
pub(crate) fn derive_layer_seed(seed: Option<u64>, name: &str) -> Option<u64> {
    seed.map(|base| determinism::derive_seed(base, name))
}

/// Rejects image batches whose `(channels, height, width)` differ from the
/// geometry a model was built for.
pub(crate) fn check_image(
    images: &FeatureGrid,
    channels: usize,
    hw: (usize, usize),
) -> PureResult<()> {
    if images.channels() != channels || images.hw() != hw {
        return Err(TensorError::ShapeMismatch {
            left: (images.channels(), images.hw().0 * images.hw().1),
            right: (channels, hw.0 * hw.1),
        });
    }
    Ok(())
}

/// Turns a `(channels, height * width)` map into `(height * width, channels)`
/// token rows.
pub(crate) fn conv_to_tokens(
    tensor: &Tensor,
    channels: usize,
    hw: (usize, usize),
) -> PureResult<Tensor> {
    let expected = (channels, hw.0 * hw.1);
    if tensor.shape() != expected {
        return Err(TensorError::ShapeMismatch {
            left: tensor.shape(),
            right: expected,
        });
    }
    Ok(tensor.transpose())
}

/// Inverse of [`conv_to_tokens`].
pub(crate) fn tokens_to_conv(
    tokens: &Tensor,
    channels: usize,
    hw: (usize, usize),
) -> PureResult<Tensor> {
    let expected = (hw.0 * hw.1, channels);
    if tokens.shape() != expected {
        return Err(TensorError::ShapeMismatch {
            left: tokens.shape(),
            right: expected,
        });
    }
    Ok(tokens.transpose())
}

/// Copies the listed rows of `tensor`, in order, into a new tensor.
pub(crate) fn gather_rows(tensor: &Tensor, rows: &[usize]) -> PureResult<Tensor> {
    let cols = tensor.shape().1;
    let mut data = Vec::with_capacity(rows.len() * cols);
    for &row in rows {
        data.extend_from_slice(tensor.row(row));
    }
    Tensor::from_vec(rows.len(), cols, data)
}

/// Writes the rows of `source` back to the listed positions of `target`.
pub(crate) fn scatter_rows(target: &mut Tensor, rows: &[usize], source: &Tensor) -> PureResult<()> {
    let cols = target.shape().1;
    if source.shape() != (rows.len(), cols) {
        return Err(TensorError::ShapeMismatch {
            left: source.shape(),
            right: (rows.len(), cols),
        });
    }
    let data = target.data_mut();
    for (src, &row) in rows.iter().enumerate() {
        data[row * cols..(row + 1) * cols].copy_from_slice(source.row(src));
    }
    Ok(())
}
