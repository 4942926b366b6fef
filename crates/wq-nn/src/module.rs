// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of WaveQ — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::HashMap;
use wq_config::determinism;
use wq_tensor::{PureResult, Tensor, TensorError};

/// Named tensor owned by a module and persisted through its state dict.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(f, "Parameter(name={},shape=({},{}))", self.name, rows, cols)
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Creates a parameter sampled from `U(-bound, bound)`.
    ///
    /// With a base seed every parameter draws from its own stream derived from
    /// its name, so two models built from one seed are identical.
    pub fn uniform(
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        bound: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        if !(bound > 0.0) || !bound.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "parameter_init_bound",
            });
        }
        let seed = seed.map(|base| determinism::derive_seed(base, &name));
        let value = Tensor::random_uniform(rows, cols, -bound, bound, seed)?;
        Ok(Self::new(name, value))
    }

    /// Creates a parameter sampled from `N(0, std²)`.
    pub fn normal(
        name: impl Into<String>,
        rows: usize,
        cols: usize,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let name = name.into();
        let seed = seed.map(|base| determinism::derive_seed(base, &name));
        let value = Tensor::random_normal(rows, cols, 0.0, std, seed)?;
        Ok(Self::new(name, value))
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the parameter name.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        if self.value.shape() != value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: value.shape(),
            });
        }
        self.value = value.clone();
        Ok(())
    }
}

/// Bound of the `U(-1/√fan_in, 1/√fan_in)` initialiser used by every layer.
pub(crate) fn fan_in_bound(fan_in: usize) -> f32 {
    1.0 / (fan_in.max(1) as f32).sqrt()
}

/// Inference-side module trait modelled on `nn.Module`.
///
/// Modules consume and produce one batch item at a time; batching happens in
/// the callers that own a [`wq_tensor::FeatureTensor`].
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Switches stochastic layers between training and evaluation behaviour.
    /// Modules without such layers keep the default no-op.
    fn set_training(&self, _training: bool) {}

    /// Total number of scalar parameters.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0usize;
        self.visit_parameters(&mut |param| {
            total += param.value().len();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }
}
