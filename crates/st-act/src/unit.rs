// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{ActError, ActResult};
use crate::halting::HaltingEstimator;
use st_nn::{accumulate_flops, zero_flops, Flops, Module, OutputMask, Parameter};
use st_tensor::{PureResult, Tensor};
use std::fmt;

/// One residual computation step.
pub trait ResidualUnit: Module + fmt::Debug {
    /// Runs the unit. With a residual mask the residual branch is scaled by
    /// the mask and FLOPs are counted through it.
    fn forward_masked(
        &self,
        input: &Tensor,
        mask: Option<&OutputMask<'_>>,
    ) -> PureResult<(Tensor, Flops)>;

    fn output_channels(&self) -> usize;
}

/// Ordered units sharing one scope, plus the halting estimators that follow
/// every unit but the last.
#[derive(Debug)]
pub struct Block {
    scope: String,
    units: Vec<Box<dyn ResidualUnit>>,
    estimators: Vec<Box<dyn HaltingEstimator>>,
}

impl Block {
    /// Scope of unit `index` inside `block_scope`, counted from one.
    pub fn unit_scope(block_scope: &str, index: usize) -> String {
        format!("{block_scope}/unit_{}", index + 1)
    }

    /// Builds one unit per argument tuple. `unit_fn` receives the unit scope.
    pub fn new<A, F>(scope: impl Into<String>, args: &[A], mut unit_fn: F) -> ActResult<Self>
    where
        F: FnMut(&str, &A) -> PureResult<Box<dyn ResidualUnit>>,
    {
        let scope = scope.into();
        if args.is_empty() {
            return Err(ActError::EmptyBlock { scope });
        }
        let units = args
            .iter()
            .enumerate()
            .map(|(index, arg)| unit_fn(&Self::unit_scope(&scope, index), arg))
            .collect::<PureResult<Vec<_>>>()?;
        Ok(Self {
            scope,
            units,
            estimators: Vec::new(),
        })
    }

    pub fn from_units(
        scope: impl Into<String>,
        units: Vec<Box<dyn ResidualUnit>>,
    ) -> ActResult<Self> {
        let scope = scope.into();
        if units.is_empty() {
            return Err(ActError::EmptyBlock { scope });
        }
        Ok(Self {
            scope,
            units,
            estimators: Vec::new(),
        })
    }

    /// Attaches exactly `N − 1` estimators.
    pub fn with_estimators(
        mut self,
        estimators: Vec<Box<dyn HaltingEstimator>>,
    ) -> ActResult<Self> {
        let expected = self.units.len() - 1;
        if estimators.len() != expected {
            return Err(ActError::EstimatorCount {
                scope: self.scope,
                expected,
                found: estimators.len(),
            });
        }
        self.estimators = estimators;
        Ok(self)
    }

    /// Builds estimators for every unit but the last from the unit scope and
    /// the unit's output channels. A builder returning `None` leaves the
    /// block static.
    pub fn attach_estimators<F>(self, mut build: F) -> ActResult<Self>
    where
        F: FnMut(&str, usize) -> PureResult<Option<Box<dyn HaltingEstimator>>>,
    {
        let channels: Vec<usize> = self
            .units
            .iter()
            .take(self.units.len() - 1)
            .map(|unit| unit.output_channels())
            .collect();
        let mut estimators = Vec::with_capacity(channels.len());
        for (index, channels) in channels.into_iter().enumerate() {
            match build(&Self::unit_scope(&self.scope, index), channels)? {
                Some(estimator) => estimators.push(estimator),
                None => return Ok(self),
            }
        }
        self.with_estimators(estimators)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    pub fn unit(&self, index: usize) -> Option<&dyn ResidualUnit> {
        self.units.get(index).map(|unit| unit.as_ref())
    }

    /// Estimator following unit `index`; the last unit never has one.
    pub fn estimator(&self, index: usize) -> Option<&dyn HaltingEstimator> {
        self.estimators.get(index).map(|estimator| estimator.as_ref())
    }

    /// Whether every non-final unit has an estimator.
    pub fn is_adaptive(&self) -> bool {
        self.estimators.len() + 1 == self.units.len()
    }

    pub fn output_channels(&self) -> usize {
        self.units
            .last()
            .map(|unit| unit.output_channels())
            .unwrap_or(0)
    }

    /// Runs every unit unconditionally and sums their FLOPs.
    pub fn forward_static(&self, input: &Tensor) -> PureResult<(Tensor, Flops)> {
        let mut flops = zero_flops(input.batch());
        let mut net = input.clone();
        for unit in &self.units {
            let (output, unit_flops) = unit.forward_masked(&net, None)?;
            accumulate_flops(&mut flops, &unit_flops)?;
            net = output;
        }
        Ok((net, flops))
    }
}

impl Module for Block {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.forward_static(input).map(|(output, _)| output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for (index, unit) in self.units.iter().enumerate() {
            unit.visit_parameters(visitor)?;
            if let Some(estimator) = self.estimators.get(index) {
                estimator.visit_parameters(visitor)?;
            }
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for (index, unit) in self.units.iter_mut().enumerate() {
            unit.visit_parameters_mut(visitor)?;
            if let Some(estimator) = self.estimators.get_mut(index) {
                estimator.visit_parameters_mut(visitor)?;
            }
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        for unit in &self.units {
            unit.set_training(training);
        }
        for estimator in &self.estimators {
            estimator.set_training(training);
        }
    }
}
