// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use ndarray::{Array1, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};

/// Moving-average decay and variance epsilon shared by a family of layers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormSettings {
    pub momentum: f32,
    pub epsilon: f32,
}

impl Default for BatchNormSettings {
    fn default() -> Self {
        Self {
            momentum: 0.997,
            epsilon: 1e-5,
        }
    }
}

/// Batch normalisation over the batch and spatial axes of an NHWC tensor.
///
/// Evaluation mode (the default) normalises with the moving statistics.
/// Training mode normalises with the batch statistics and folds them into the
/// moving averages with `moving = momentum · moving + (1 − momentum) · batch`.
#[derive(Debug)]
pub struct BatchNorm2d {
    features: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    moving_mean: RefCell<Parameter>,
    moving_variance: RefCell<Parameter>,
    training: Cell<bool>,
}

impl BatchNorm2d {
    pub fn new(
        name: impl Into<String>,
        features: usize,
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if features == 0 {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_features",
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let shape = [1, 1, 1, features];
        Ok(Self {
            features,
            epsilon,
            momentum,
            gamma: Parameter::new(format!("{name}::gamma"), Tensor::full(shape, 1.0)?),
            beta: Parameter::new(format!("{name}::beta"), Tensor::zeros(shape)?),
            moving_mean: RefCell::new(Parameter::buffer(
                format!("{name}::moving_mean"),
                Tensor::zeros(shape)?,
            )),
            moving_variance: RefCell::new(Parameter::buffer(
                format!("{name}::moving_variance"),
                Tensor::full(shape, 1.0)?,
            )),
            training: Cell::new(false),
        })
    }

    pub fn from_settings(
        name: impl Into<String>,
        features: usize,
        settings: BatchNormSettings,
    ) -> PureResult<Self> {
        Self::new(name, features, settings.momentum, settings.epsilon)
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        if input.channels() != self.features {
            let [n, h, w, _] = input.shape();
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: vec![n, h, w, self.features],
            });
        }
        Ok(())
    }

    fn batch_statistics(input: &Tensor) -> PureResult<(Array1<f32>, Array1<f32>)> {
        let [n, h, w, c] = input.shape();
        let flat = input
            .array()
            .view()
            .into_shape((n * h * w, c))
            .map_err(|_| TensorError::InvalidShape {
                shape: input.shape().to_vec(),
            })?;
        let mean = flat
            .mean_axis(Axis(0))
            .ok_or(TensorError::EmptyInput("batchnorm_input"))?;
        let variance = flat.var_axis(Axis(0), 0.0);
        Ok((mean, variance))
    }

    fn update_moving(&self, mean: &Array1<f32>, variance: &Array1<f32>) -> PureResult<()> {
        let decay = self.momentum;
        for (slot, batch) in [(&self.moving_mean, mean), (&self.moving_variance, variance)] {
            let mut param = slot.borrow_mut();
            let current = param.value().array();
            let updated = Array4::from_shape_fn(current.dim(), |(_, _, _, c)| {
                decay * current[[0, 0, 0, c]] + (1.0 - decay) * batch[c]
            });
            param.load_value(&Tensor::from_array(updated)?)?;
        }
        Ok(())
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (mean, variance) = if self.training.get() {
            let (mean, variance) = Self::batch_statistics(input)?;
            self.update_moving(&mean, &variance)?;
            (mean, variance)
        } else {
            let mean: Array1<f32> = self.moving_mean.borrow().value().array().iter().copied().collect();
            let variance: Array1<f32> = self
                .moving_variance
                .borrow()
                .value()
                .array()
                .iter()
                .copied()
                .collect();
            (mean, variance)
        };
        let gamma = self.gamma.value().array();
        let beta = self.beta.value().array();
        let scale: Array1<f32> = Array1::from_shape_fn(self.features, |c| {
            gamma[[0, 0, 0, c]] / (variance[c] + self.epsilon).sqrt()
        });
        let shift: Array1<f32> =
            Array1::from_shape_fn(self.features, |c| beta[[0, 0, 0, c]] - mean[c] * scale[c]);
        let data = &input.array().view() * &scale + &shift;
        Tensor::from_array(data)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)?;
        visitor(&*self.moving_mean.borrow())?;
        visitor(&*self.moving_variance.borrow())?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)?;
        visitor(self.moving_mean.get_mut())?;
        visitor(self.moving_variance.get_mut())?;
        Ok(())
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_uses_moving_statistics() {
        let bn = BatchNorm2d::new("bn", 2, 0.997, 1e-5).unwrap();
        let input = Tensor::from_fn([1, 2, 2, 2], |[_, y, x, c]| (y + x + c) as f32).unwrap();
        let output = bn.forward(&input).unwrap();
        let scale = 1.0 / (1.0f32 + 1e-5).sqrt();
        assert!((output.array()[[0, 1, 1, 1]] - 3.0 * scale).abs() < 1e-6);
        assert_eq!(bn.state_dict().unwrap().len(), 4);
    }

    #[test]
    fn training_whitens_and_updates_moving_averages() {
        let bn = BatchNorm2d::new("bn", 1, 0.5, 1e-5).unwrap();
        bn.set_training(true);
        let input = Tensor::from_vec([2, 1, 1, 1], vec![1.0, 3.0]).unwrap();
        let output = bn.forward(&input).unwrap();
        let values = output.to_vec();
        assert!((values[0] + 1.0).abs() < 1e-3);
        assert!((values[1] - 1.0).abs() < 1e-3);
        let state = bn.state_dict().unwrap();
        assert!((state["bn::moving_mean"].mean() - 1.0).abs() < 1e-6);
        assert!((state["bn::moving_variance"].mean() - 1.0).abs() < 1e-6);
        assert!(bn.is_training());
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        assert!(BatchNorm2d::new("bn", 0, 0.9, 1e-5).is_err());
        assert!(BatchNorm2d::new("bn", 2, 1.5, 1e-5).is_err());
        assert!(BatchNorm2d::new("bn", 2, 0.9, 0.0).is_err());
        let bn = BatchNorm2d::new("bn", 3, 0.9, 1e-5).unwrap();
        assert!(bn.forward(&Tensor::zeros([1, 1, 1, 2]).unwrap()).is_err());
    }
}
