// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Named tensor owned by a module.
///
/// Trainable parameters are weights and biases; buffers (batch-norm moving
/// statistics) are persisted in checkpoints but never receive updates.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    name: String,
    value: Tensor,
    trainable: bool,
}

impl Parameter {
    /// Creates a new trainable parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            trainable: true,
        }
    }

    /// Creates a non-trainable buffer.
    pub fn buffer(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            trainable: false,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the parameter name.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Replaces the value, keeping the shape fixed.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        if self.value.shape() != value.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape().to_vec(),
                right: value.shape().to_vec(),
            });
        }
        self.value = value.clone();
        Ok(())
    }

    /// Number of scalars held by the parameter.
    pub fn numel(&self) -> usize {
        self.value.len()
    }
}

/// Forward-only module surface shared by layers, units and networks.
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

    /// Switches layers with batch statistics between training and evaluation.
    fn set_training(&self, _training: bool) {}

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
        self.load_state_dict_filtered(state, &|_: &str| true)
    }

    /// Restores only the parameters accepted by `keep`; the rest keep their
    /// current values.
    fn load_state_dict_filtered(
        &mut self,
        state: &HashMap<String, Tensor>,
        keep: &dyn Fn(&str) -> bool,
    ) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            if !keep(param.name()) {
                return Ok(());
            }
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }

    /// Total number of scalars across every parameter and buffer.
    fn parameter_count(&self) -> PureResult<usize> {
        let mut total = 0;
        self.visit_parameters(&mut |param| {
            total += param.numel();
            Ok(())
        })?;
        Ok(total)
    }
}
