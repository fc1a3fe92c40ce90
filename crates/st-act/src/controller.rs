// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The halting loop.
//!
//! The loop is bounded by the number of units in the block. At step `t` every
//! element that has not halted yet receives the weight `p_t` of its halting
//! probability, or its remaining mass when `cumulative + p_t ≥ 1 − ε` or when
//! `t` is the last unit. The block output is `Σ_t weight_t · output_t`, so the
//! weights of every element sum to one.

use crate::error::{ActError, ActResult};
use crate::unit::Block;
use ndarray::{stack, Array3, Array4, ArrayView3, Axis, Zip};
use st_nn::{accumulate_flops, zero_flops, Flops, MaskedFlopPolicy, OutputMask};
use st_tensor::{resize_nearest_map, Tensor, TensorError};
use tracing::debug;

/// Which halting loop to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HaltingVariant {
    /// Per-image halting; every unit runs for the whole batch.
    Act,
    /// Per-image halting that stops once the whole batch has halted.
    ActEarlyStopping,
    /// Per-position halting with residual masks.
    Sact,
}

impl HaltingVariant {
    pub fn is_spatial(&self) -> bool {
        matches!(self, HaltingVariant::Sact)
    }
}

/// Per-element halting bookkeeping over a `batch × h × w` grid.
#[derive(Clone, Debug, PartialEq)]
pub struct HaltingState {
    cumulative: Array3<f32>,
    remainder: Array3<f32>,
    halted: Array3<bool>,
    executed: Array3<u32>,
}

impl HaltingState {
    pub fn new(batch: usize, height: usize, width: usize) -> Self {
        let dim = (batch, height, width);
        Self {
            cumulative: Array3::zeros(dim),
            remainder: Array3::ones(dim),
            halted: Array3::from_elem(dim, false),
            executed: Array3::zeros(dim),
        }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.cumulative.dim()
    }

    pub fn cumulative(&self) -> &Array3<f32> {
        &self.cumulative
    }

    pub fn remainder(&self) -> &Array3<f32> {
        &self.remainder
    }

    pub fn halted(&self) -> &Array3<bool> {
        &self.halted
    }

    pub fn executed(&self) -> &Array3<u32> {
        &self.executed
    }

    pub fn all_halted(&self) -> bool {
        self.halted.iter().all(|&halted| halted)
    }

    /// Per-image flag: at least one element of the image is still running.
    pub fn active_images(&self) -> Vec<bool> {
        self.halted
            .outer_iter()
            .map(|image| image.iter().any(|&halted| !halted))
            .collect()
    }

    /// `remainder` where the element is still running, zero where it halted.
    pub fn residual_mask(&self) -> Array3<f32> {
        Zip::from(&self.remainder)
            .and(&self.halted)
            .map_collect(|&remainder, &halted| if halted { 0.0 } else { remainder })
    }

    /// `executed + remainder`.
    pub fn ponder_cost(&self) -> Array3<f32> {
        Zip::from(&self.executed)
            .and(&self.remainder)
            .map_collect(|&executed, &remainder| executed as f32 + remainder)
    }

    /// Consumes one step. `probability` is `None` on the last unit, which
    /// forces every running element to halt. Probabilities are clamped to
    /// `[0, 1]`; non-finite values are rejected before any state changes.
    /// Returns the weight each element assigns to this step's output.
    pub fn advance(
        &mut self,
        probability: Option<ArrayView3<'_, f32>>,
        epsilon: f32,
    ) -> Result<Array3<f32>, TensorError> {
        if let Some(map) = &probability {
            if map.dim() != self.dim() {
                let (n, h, w) = self.dim();
                let (pn, ph, pw) = map.dim();
                return Err(TensorError::ShapeMismatch {
                    left: vec![n, h, w],
                    right: vec![pn, ph, pw],
                });
            }
            if let Some(&value) = map.iter().find(|v| !v.is_finite()) {
                return Err(TensorError::NonFiniteValue {
                    label: "halting_probability",
                    value,
                });
            }
        }

        let threshold = 1.0 - epsilon;
        let mut weights = Array3::<f32>::zeros(self.dim());
        for (index, weight) in weights.indexed_iter_mut() {
            if self.halted[index] {
                continue;
            }
            self.executed[index] += 1;
            let Some(map) = &probability else {
                *weight = self.remainder[index];
                self.halted[index] = true;
                continue;
            };
            let p = map[index].clamp(0.0, 1.0);
            let cumulative = self.cumulative[index] + p;
            if cumulative >= threshold {
                *weight = self.remainder[index];
                self.halted[index] = true;
            } else {
                *weight = p;
                self.cumulative[index] = cumulative;
                self.remainder[index] = (1.0 - cumulative).max(0.0);
            }
        }
        Ok(weights)
    }
}

/// Everything the halting loop produces for one block.
#[derive(Clone, Debug)]
pub struct HaltingOutcome {
    /// Halting-weighted mixture of the unit outputs.
    pub output: Tensor,
    pub ponder_cost: Array3<f32>,
    pub num_units: Array3<u32>,
    pub flops: Flops,
    /// `batch × h × w × N` per-step weights; steps skipped by early stopping
    /// are zero.
    pub halting_distribution: Array4<f32>,
    /// Final residual mask (SACT only).
    pub residual_mask: Option<Array3<f32>>,
}

/// Runs the halting loop over a block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveComputation {
    epsilon: f32,
    flop_policy: MaskedFlopPolicy,
}

impl Default for AdaptiveComputation {
    fn default() -> Self {
        Self {
            epsilon: crate::config::DEFAULT_EPSILON,
            flop_policy: MaskedFlopPolicy::default(),
        }
    }
}

impl AdaptiveComputation {
    pub fn new(epsilon: f32, flop_policy: MaskedFlopPolicy) -> Self {
        Self {
            epsilon,
            flop_policy,
        }
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn flop_policy(&self) -> MaskedFlopPolicy {
        self.flop_policy
    }

    /// Runs `block` on `input` with the given halting variant.
    pub fn run(
        &self,
        block: &Block,
        input: &Tensor,
        variant: HaltingVariant,
    ) -> ActResult<HaltingOutcome> {
        let scope = block.scope();
        let num_units = block.num_units();
        if num_units == 0 {
            return Err(ActError::EmptyBlock {
                scope: scope.to_string(),
            });
        }
        if !block.is_adaptive() {
            return Err(ActError::EstimatorCount {
                scope: scope.to_string(),
                expected: num_units - 1,
                found: (0..num_units)
                    .filter(|&index| block.estimator(index).is_some())
                    .count(),
            });
        }

        let batch = input.batch();
        let spatial = variant.is_spatial();
        let mut state: Option<HaltingState> = None;
        let mut accumulated: Option<Tensor> = None;
        let mut steps: Vec<Array3<f32>> = Vec::with_capacity(num_units);
        let mut flops = zero_flops(batch);
        let mut net = input.clone();

        for index in 0..num_units {
            let unit = block.unit(index).ok_or_else(|| ActError::EmptyBlock {
                scope: scope.to_string(),
            })?;
            let mask_values = match (&state, spatial) {
                (Some(state), true) => Some(state.residual_mask()),
                _ => None,
            };
            let mask = mask_values
                .as_ref()
                .map(|values| OutputMask::new(values.view(), self.flop_policy));

            let (output, mut step_flops) = unit.forward_masked(&net, mask.as_ref())?;
            let last = index + 1 == num_units;
            let probability = match block.estimator(index) {
                Some(estimator) if !last => {
                    let estimate = estimator.estimate(&output, mask.as_ref())?;
                    accumulate_flops(&mut step_flops, &estimate.flops)?;
                    Some(estimate.map)
                }
                _ => None,
            };

            let (out_h, out_w) = output.spatial();
            let state = state.get_or_insert_with(|| {
                if spatial {
                    HaltingState::new(batch, out_h, out_w)
                } else {
                    HaltingState::new(batch, 1, 1)
                }
            });
            let (_, state_h, state_w) = state.dim();
            if spatial && (state_h, state_w) != (out_h, out_w) {
                return Err(TensorError::ShapeMismatch {
                    left: vec![batch, state_h, state_w],
                    right: output.shape().to_vec(),
                }
                .into());
            }

            if step_flops.len() != batch {
                return Err(TensorError::ShapeMismatch {
                    left: vec![batch],
                    right: vec![step_flops.len()],
                }
                .into());
            }
            if spatial {
                flops += &step_flops;
            } else {
                for (image, active) in state.active_images().into_iter().enumerate() {
                    if active {
                        flops[image] += step_flops[image];
                    }
                }
            }

            let probability = match probability {
                Some(map) if map.dim() != state.dim() => {
                    Some(resize_nearest_map(map.view(), state_h, state_w)?)
                }
                other => other,
            };
            let weights = state
                .advance(probability.as_ref().map(|map| map.view()), self.epsilon)
                .map_err(|err| match err {
                    TensorError::NonFiniteValue { value, .. } => ActError::NonFiniteProbability {
                        scope: scope.to_string(),
                        unit: index,
                        value,
                    },
                    other => ActError::Tensor(other),
                })?;

            let contribution = output.mul_map(&weights.view())?;
            accumulated = Some(match accumulated {
                Some(sum) => sum.add(&contribution)?,
                None => contribution,
            });
            steps.push(weights);
            net = output;

            if variant == HaltingVariant::ActEarlyStopping && state.all_halted() {
                break;
            }
        }

        let state = state.ok_or_else(|| ActError::EmptyBlock {
            scope: scope.to_string(),
        })?;
        let output = accumulated.ok_or_else(|| ActError::EmptyBlock {
            scope: scope.to_string(),
        })?;
        let (n, h, w) = state.dim();
        while steps.len() < num_units {
            steps.push(Array3::zeros((n, h, w)));
        }
        let views: Vec<ArrayView3<'_, f32>> = steps.iter().map(|step| step.view()).collect();
        let halting_distribution = stack(Axis(3), &views).map_err(|_| {
            ActError::Tensor(TensorError::InvalidShape {
                shape: vec![n, h, w, num_units],
            })
        })?;

        let outcome = HaltingOutcome {
            output,
            ponder_cost: state.ponder_cost(),
            num_units: state.executed().clone(),
            flops,
            halting_distribution,
            residual_mask: spatial.then(|| state.residual_mask()),
        };
        debug!(
            scope,
            ?variant,
            mean_units = outcome.num_units.iter().map(|&u| f64::from(u)).sum::<f64>()
                / outcome.num_units.len().max(1) as f64,
            mean_ponder_cost = outcome.ponder_cost.mean().unwrap_or(0.0),
            mean_flops = outcome.flops.mean().unwrap_or(0.0),
            "block halted"
        );
        Ok(outcome)
    }
}
