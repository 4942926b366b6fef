// SPDX-License-Identifier: AGPL-3.0-or-later

use tracing::trace;
use wq_nn::layers::{Dropout, Linear, Relu, Sequential, Sigmoid};
use wq_nn::module::{Module, Parameter};
use wq_tensor::{FeatureTensor, PureResult, Tensor, TensorError};

use crate::models::utils::derive_layer_seed;

/// Added to the weight sum so an all-zero weight map still yields a finite
/// score.
pub const DEFAULT_POOLING_EPSILON: f32 = 1.0e-6;

/// Weighted mean `Σ q·w / (Σ w + ε)`.
pub fn weighted_mean(quality: &[f32], weight: &[f32], epsilon: f32) -> PureResult<f32> {
    if quality.len() != weight.len() {
        return Err(TensorError::ShapeMismatch {
            left: (quality.len(), 1),
            right: (weight.len(), 1),
        });
    }
    if quality.is_empty() {
        return Err(TensorError::EmptyInput("pooling"));
    }
    let mut numerator = 0.0f32;
    let mut denominator = 0.0f32;
    for (&q, &w) in quality.iter().zip(weight) {
        if !q.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "pooling.quality",
                value: q,
            });
        }
        if !w.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "pooling.weight",
                value: w,
            });
        }
        if w < 0.0 {
            return Err(TensorError::InvalidValue {
                label: "pooling.weight",
            });
        }
        numerator += q * w;
        denominator += w;
    }
    Ok(numerator / (denominator + epsilon))
}

/// Two MLP heads over per-location feature vectors: a non-negative quality
/// estimate and a `(0, 1)` importance weight, pooled into one score.
#[derive(Debug)]
pub struct WeightedPoolingHead {
    quality: Sequential,
    weight: Sequential,
    channels: usize,
    epsilon: f32,
}

impl WeightedPoolingHead {
    pub fn new(
        name: &str,
        channels: usize,
        outputs: usize,
        drop: f32,
        epsilon: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if !(epsilon > 0.0) {
            return Err(TensorError::InvalidValue {
                label: "pooling.epsilon",
            });
        }
        let head = |suffix: &str| -> PureResult<Sequential> {
            let prefix = format!("{name}.{suffix}");
            let first = format!("{prefix}.0");
            let last = format!("{prefix}.3");
            Ok(Sequential::new()
                .with(Linear::with_seed(
                    first.as_str(),
                    channels,
                    channels,
                    derive_layer_seed(seed, &first),
                )?)
                .with(Relu::new())
                .with(Dropout::with_seed(
                    drop,
                    derive_layer_seed(seed, &format!("{prefix}.2")),
                )?)
                .with(Linear::with_seed(
                    last.as_str(),
                    channels,
                    outputs,
                    derive_layer_seed(seed, &last),
                )?))
        };
        Ok(Self {
            quality: head("fc_score")?.with(Relu::new()),
            weight: head("fc_weight")?.with(Sigmoid::new()),
            channels,
            epsilon,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Pools every `(locations, channels)` item into one score, in order.
    pub fn pool(&self, features: &FeatureTensor) -> PureResult<Vec<f32>> {
        let mut scores = vec![0.0f32; features.batch()];
        for (slot, item) in scores.iter_mut().zip(features.items()) {
            *slot = self.score(item)?;
        }
        trace!(batch = scores.len(), "pooled");
        Ok(scores)
    }

    fn score(&self, item: &Tensor) -> PureResult<f32> {
        if item.shape().1 != self.channels {
            return Err(TensorError::ShapeMismatch {
                left: item.shape(),
                right: (item.shape().0, self.channels),
            });
        }
        let quality = self.quality.forward(item)?;
        let weight = self.weight.forward(item)?;
        weighted_mean(quality.data(), weight.data(), self.epsilon)
    }
}

impl Module for WeightedPoolingHead {
    /// Scores a single `(locations, channels)` item as a `(1, 1)` tensor.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Tensor::from_vec(1, 1, vec![self.score(input)?])
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.quality.visit_parameters(visitor)?;
        self.weight.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.quality.visit_parameters_mut(visitor)?;
        self.weight.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.quality.set_training(training);
        self.weight.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn constant_weights_reduce_to_the_mean() {
        let quality = [0.2f32, 0.4, 0.9, 0.5];
        let score = weighted_mean(&quality, &[0.5; 4], DEFAULT_POOLING_EPSILON).unwrap();
        assert_relative_eq!(score, 0.5, epsilon = 1e-5);
    }

    #[test]
    fn zero_weights_stay_finite() {
        let score = weighted_mean(&[3.0, 4.0], &[0.0, 0.0], DEFAULT_POOLING_EPSILON).unwrap();
        assert_eq!(score, 0.0);
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(matches!(
            weighted_mean(&[1.0], &[1.0, 1.0], 1e-6),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            weighted_mean(&[1.0], &[-0.5], 1e-6),
            Err(TensorError::InvalidValue { .. })
        ));
        assert!(matches!(
            weighted_mean(&[f32::NAN], &[0.5], 1e-6),
            Err(TensorError::NonFiniteValue { .. })
        ));
    }

    #[test]
    fn head_emits_one_score_per_item_in_order() {
        let head = WeightedPoolingHead::new("head", 8, 1, 0.1, 1e-6, Some(9)).unwrap();
        head.set_training(false);
        let a = Tensor::from_fn(6, 8, |r, c| ((r + c) as f32 * 0.1).sin()).unwrap();
        let b = Tensor::from_fn(6, 8, |r, c| ((r * c) as f32 * 0.3).cos()).unwrap();
        let scores = head
            .pool(&FeatureTensor::new(vec![a.clone(), b.clone()]).unwrap())
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|s| s.is_finite() && *s >= 0.0));
        assert_eq!(scores[0], head.forward(&a).unwrap().data()[0]);
        assert_eq!(scores[1], head.forward(&b).unwrap().data()[0]);
    }

    #[test]
    fn flat_weight_head_pools_to_the_quality_mean() {
        let mut head = WeightedPoolingHead::new("head", 8, 1, 0.0, 1e-6, Some(5)).unwrap();
        head.set_training(false);
        head.visit_parameters_mut(&mut |param| {
            if param.name().starts_with("head.fc_weight.3::") {
                let (rows, cols) = param.value().shape();
                param.load_value(&Tensor::zeros(rows, cols)?)?;
            }
            Ok(())
        })
        .unwrap();
        let item = Tensor::from_fn(10, 8, |r, c| ((r * 8 + c) as f32 * 0.17).sin()).unwrap();
        let weight = head.weight.forward(&item).unwrap();
        assert!(weight.data().iter().all(|&w| w == 0.5));
        let quality = head.quality.forward(&item).unwrap();
        let mean = quality.data().iter().sum::<f32>() / quality.len() as f32;
        let score = head.pool(&FeatureTensor::new(vec![item]).unwrap()).unwrap()[0];
        assert_relative_eq!(score, mean, epsilon = 1e-5);
    }

    #[test]
    fn parameters_are_named_after_both_heads() {
        let head = WeightedPoolingHead::new("head", 4, 1, 0.0, 1e-6, None).unwrap();
        let state = head.state_dict().unwrap();
        assert_eq!(state.len(), 8);
        assert!(state.contains_key("head.fc_score.0::weight"));
        assert!(state.contains_key("head.fc_weight.3::bias"));
    }
}
