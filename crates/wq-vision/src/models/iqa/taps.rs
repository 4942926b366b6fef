// SPDX-License-Identifier: AGPL-3.0-or-later

use tracing::trace;
use wq_tensor::{FeatureTensor, PureResult, Tensor, TensorError};

/// Block indices read from a twelve-block backbone.
pub const DEFAULT_TAP_DEPTHS: [usize; 4] = [6, 7, 8, 9];

/// Collects the block outputs of one backbone pass and fuses the configured
/// taps into a single wide token tensor.
///
/// The collector is single use per capture: [`TapCollector::extract`] must be
/// followed by [`TapCollector::reset`] (or a fresh capture) before it can be
/// read again.
#[derive(Debug, Clone)]
pub struct TapCollector {
    depths: [usize; 4],
    outputs: Vec<FeatureTensor>,
    extracted: bool,
}

impl Default for TapCollector {
    fn default() -> Self {
        Self::new(DEFAULT_TAP_DEPTHS)
    }
}

impl TapCollector {
    pub fn new(depths: [usize; 4]) -> Self {
        Self {
            depths,
            outputs: Vec::new(),
            extracted: false,
        }
    }

    pub fn depths(&self) -> [usize; 4] {
        self.depths
    }

    /// Number of block outputs currently held.
    pub fn captured(&self) -> usize {
        self.outputs.len()
    }

    /// Stores the ordered block outputs of one backbone pass.
    pub fn capture(&mut self, block_outputs: Vec<FeatureTensor>) {
        self.outputs = block_outputs;
        self.extracted = false;
    }

    /// Clears the capture list.
    pub fn reset(&mut self) {
        self.outputs.clear();
        self.extracted = false;
    }

    /// Drops the class token of every tapped block and concatenates the taps
    /// along the channel axis, yielding `(tokens, 4 * width)` items.
    pub fn extract(&mut self) -> PureResult<FeatureTensor> {
        if self.extracted {
            return Err(TensorError::configuration(
                "taps.extract",
                "taps were already extracted; reset or capture a new pass first",
            ));
        }
        let required = self.depths.iter().max().map_or(0, |d| d + 1);
        if self.outputs.len() < required {
            return Err(TensorError::configuration(
                "taps.extract",
                format!(
                    "captured {} block outputs but tap depths {:?} need {required}",
                    self.outputs.len(),
                    self.depths
                ),
            ));
        }
        let taps: Vec<&FeatureTensor> = self.depths.iter().map(|&d| &self.outputs[d]).collect();
        let (rows, _) = taps[0].item_shape();
        if rows < 2 {
            return Err(TensorError::EmptyInput("tap tokens"));
        }
        let batch = taps[0].batch();
        let mut items = Vec::with_capacity(batch);
        for b in 0..batch {
            let parts = taps
                .iter()
                .map(|tap| match tap.item(b) {
                    Some(item) => item.slice_rows(1, item.shape().0),
                    None => Err(TensorError::ShapeMismatch {
                        left: (tap.batch(), rows),
                        right: (batch, rows),
                    }),
                })
                .collect::<PureResult<Vec<Tensor>>>()?;
            items.push(Tensor::cat_cols(&parts)?);
        }
        self.extracted = true;
        let fused = FeatureTensor::new(items)?;
        trace!(shape = ?fused.item_shape(), "taps extracted");
        Ok(fused)
    }
}
