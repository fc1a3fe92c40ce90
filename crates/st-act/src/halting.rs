// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Halting-probability estimators.
//!
//! Both variants live under the `{unit_scope}/halting_proba` parameter scope,
//! which is what fine-tuning uses to tell halting parameters apart from the
//! backbone.

use crate::config::{ActConfig, AdaptationMode};
use ndarray::Array3;
use st_nn::{
    accumulate_flops, resize_mask, BatchNorm2d, BatchNormSettings, Conv2d, Flops, Module, OutputMask, Parameter,
};
use st_tensor::{PureResult, Tensor};
use std::fmt;

/// Probability map produced after a unit, with the FLOPs spent on it.
#[derive(Clone, Debug, PartialEq)]
pub struct HaltingProbability {
    /// `batch × 1 × 1` for ACT, `batch × h × w` for SACT.
    pub map: Array3<f32>,
    pub flops: Flops,
}

/// Predicts the probability of halting after a unit from the unit's output.
pub trait HaltingEstimator: Module + fmt::Debug {
    /// `mask` is the residual mask of the current step, if any; it only
    /// restricts FLOP counting.
    fn estimate(
        &self,
        outputs: &Tensor,
        mask: Option<&OutputMask<'_>>,
    ) -> PureResult<HaltingProbability>;
}

fn halting_scope(unit_scope: &str) -> String {
    format!("{unit_scope}/halting_proba")
}

/// Pooled estimator: mean-pool, batch norm, 1×1 convolution, sigmoid.
#[derive(Debug)]
pub struct GlobalHaltingEstimator {
    bn: BatchNorm2d,
    conv: Conv2d,
}

impl GlobalHaltingEstimator {
    pub fn new(
        unit_scope: &str,
        channels: usize,
        init_bias: f32,
        bn: BatchNormSettings,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let scope = halting_scope(unit_scope);
        Ok(Self {
            bn: BatchNorm2d::from_settings(format!("{scope}/global_bn"), channels, bn)?,
            conv: Conv2d::new(format!("{scope}/global_conv"), channels, 1, (1, 1), 1, seed)?
                .with_bias(init_bias)?,
        })
    }
}

impl HaltingEstimator for GlobalHaltingEstimator {
    fn estimate(
        &self,
        outputs: &Tensor,
        _mask: Option<&OutputMask<'_>>,
    ) -> PureResult<HaltingProbability> {
        let pooled = self.bn.forward(&outputs.mean_spatial()?)?;
        let (logits, flops) = self.conv.forward_masked(&pooled, None)?;
        Ok(HaltingProbability {
            map: logits.sigmoid().to_map()?,
            flops,
        })
    }
}

impl Module for GlobalHaltingEstimator {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Tensor::from_map(self.estimate(input, None)?.map)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn.visit_parameters(visitor)?;
        self.conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.bn.visit_parameters_mut(visitor)?;
        self.conv.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.bn.set_training(training);
    }
}

/// Spatial estimator used by SACT.
///
/// A `k × k` convolution over the batch-normalised features yields local
/// logits; a pooled path without bias yields one global logit per image that
/// is broadcast-added before the sigmoid. When a resolution is configured the
/// local path runs on features resized to it, and the returned map has that
/// resolution.
#[derive(Debug)]
pub struct ConvHaltingEstimator {
    local_bn: BatchNorm2d,
    local_conv: Conv2d,
    global_bn: BatchNorm2d,
    global_conv: Conv2d,
    resolution: Option<(usize, usize)>,
}

impl ConvHaltingEstimator {
    pub fn new(
        unit_scope: &str,
        channels: usize,
        config: &ActConfig,
        bn: BatchNormSettings,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let scope = halting_scope(unit_scope);
        let k = config.sact_kernel_size;
        Ok(Self {
            local_bn: BatchNorm2d::from_settings(format!("{scope}/local_bn"), channels, bn)?,
            local_conv: Conv2d::new(format!("{scope}/local_conv"), channels, 1, (k, k), 1, seed)?
                .with_bias(config.init_bias)?,
            global_bn: BatchNorm2d::from_settings(format!("{scope}/global_bn"), channels, bn)?,
            global_conv: Conv2d::new(
                format!("{scope}/global_conv"),
                channels,
                1,
                (1, 1),
                1,
                seed,
            )?,
            resolution: config.sact_resolution,
        })
    }

    pub fn resolution(&self) -> Option<(usize, usize)> {
        self.resolution
    }
}

impl HaltingEstimator for ConvHaltingEstimator {
    fn estimate(
        &self,
        outputs: &Tensor,
        mask: Option<&OutputMask<'_>>,
    ) -> PureResult<HaltingProbability> {
        let local_input = match self.resolution {
            Some((h, w)) if (h, w) != outputs.spatial() => outputs.resize_nearest(h, w)?,
            _ => outputs.clone(),
        };
        let (lh, lw) = local_input.spatial();
        let resized = match mask {
            Some(mask) => resize_mask(mask, lh, lw)?,
            None => None,
        };
        let local_mask = match (resized.as_ref(), mask) {
            (Some(values), Some(mask)) => Some(OutputMask::new(values.view(), mask.policy())),
            (None, Some(mask)) => Some(OutputMask::new(mask.values().reborrow(), mask.policy())),
            _ => None,
        };

        let local = self.local_bn.forward(&local_input)?;
        let (local_logits, mut flops) = self.local_conv.forward_masked(&local, local_mask.as_ref())?;

        let global = self.global_bn.forward(&outputs.mean_spatial()?)?;
        let (global_logits, global_flops) = self.global_conv.forward_masked(&global, None)?;
        accumulate_flops(&mut flops, &global_flops)?;

        let logits = local_logits.broadcast_add(&global_logits)?;
        Ok(HaltingProbability {
            map: logits.sigmoid().to_map()?,
            flops,
        })
    }
}

impl Module for ConvHaltingEstimator {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Tensor::from_map(self.estimate(input, None)?.map)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.local_bn.visit_parameters(visitor)?;
        self.local_conv.visit_parameters(visitor)?;
        self.global_bn.visit_parameters(visitor)?;
        self.global_conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.local_bn.visit_parameters_mut(visitor)?;
        self.local_conv.visit_parameters_mut(visitor)?;
        self.global_bn.visit_parameters_mut(visitor)?;
        self.global_conv.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.local_bn.set_training(training);
        self.global_bn.set_training(training);
    }
}

/// Builds the estimator matching `config.mode` for a unit producing
/// `channels` features; static blocks get none.
pub fn build_estimator(
    unit_scope: &str,
    channels: usize,
    config: &ActConfig,
    bn: BatchNormSettings,
    seed: Option<u64>,
) -> PureResult<Option<Box<dyn HaltingEstimator>>> {
    Ok(match config.mode {
        AdaptationMode::Static => None,
        AdaptationMode::Act | AdaptationMode::ActEarlyStopping => Some(Box::new(
            GlobalHaltingEstimator::new(unit_scope, channels, config.init_bias, bn, seed)?,
        )),
        AdaptationMode::Sact => Some(Box::new(ConvHaltingEstimator::new(
            unit_scope, channels, config, bn, seed,
        )?)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_nn::MaskedFlopPolicy;

    fn features(shape: [usize; 4]) -> Tensor {
        Tensor::random_uniform(shape, -1.0, 1.0, Some(11)).unwrap()
    }

    #[test]
    fn global_estimator_starts_near_sigmoid_of_bias() {
        let estimator =
            GlobalHaltingEstimator::new("block1/unit_1", 8, -3.0, BatchNormSettings::default(), Some(1))
                .unwrap();
        let proba = estimator.estimate(&features([2, 4, 4, 8]), None).unwrap();
        assert_eq!(proba.map.dim(), (2, 1, 1));
        assert!(proba.map.iter().all(|&p| p > 0.0 && p < 1.0));
        assert_eq!(proba.flops.to_vec(), vec![16.0, 16.0]);
        let names: Vec<String> = estimator.state_dict().unwrap().into_keys().collect();
        assert!(names
            .iter()
            .all(|name| name.starts_with("block1/unit_1/halting_proba/global_")));
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn conv_estimator_is_spatial_and_masks_flops() {
        let config = ActConfig::default().with_mode(AdaptationMode::Sact);
        let estimator =
            ConvHaltingEstimator::new("block2/unit_1", 4, &config, BatchNormSettings::default(), Some(2))
                .unwrap();
        let outputs = features([1, 3, 3, 4]);
        let dense = estimator.estimate(&outputs, None).unwrap();
        assert_eq!(dense.map.dim(), (1, 3, 3));
        let local = 2.0 * 9.0 * 4.0 * 9.0;
        let global = 2.0 * 4.0;
        assert_eq!(dense.flops[0], local + global);

        let mut values = Array3::<f32>::zeros((1, 3, 3));
        values[[0, 1, 1]] = 0.4;
        let mask = OutputMask::new(values.view(), MaskedFlopPolicy::ActivePositions);
        let masked = estimator.estimate(&outputs, Some(&mask)).unwrap();
        assert_eq!(masked.flops[0], 2.0 * 9.0 * 4.0 + global);
        assert_eq!(masked.map, dense.map);
    }

    #[test]
    fn conv_estimator_runs_at_configured_resolution() {
        let config = ActConfig {
            mode: AdaptationMode::Sact,
            sact_kernel_size: 1,
            sact_resolution: Some((2, 2)),
            ..ActConfig::default()
        };
        let estimator =
            ConvHaltingEstimator::new("block3/unit_2", 4, &config, BatchNormSettings::default(), None)
                .unwrap();
        let proba = estimator.estimate(&features([2, 6, 6, 4]), None).unwrap();
        assert_eq!(proba.map.dim(), (2, 2, 2));
        assert_eq!(estimator.resolution(), Some((2, 2)));
    }

    #[test]
    fn conv_estimator_resamples_the_mask_to_its_resolution() {
        let config = ActConfig {
            mode: AdaptationMode::Sact,
            sact_kernel_size: 1,
            sact_resolution: Some((2, 2)),
            ..ActConfig::default()
        };
        let estimator =
            ConvHaltingEstimator::new("block3/unit_1", 4, &config, BatchNormSettings::default(), Some(3))
                .unwrap();
        let mut values = Array3::<f32>::zeros((1, 4, 4));
        values[[0, 0, 0]] = 1.0;
        let mask = OutputMask::new(values.view(), MaskedFlopPolicy::ActivePositions);
        let proba = estimator.estimate(&features([1, 4, 4, 4]), Some(&mask)).unwrap();
        assert_eq!(proba.map.dim(), (1, 2, 2));
        // One active cell of the 2×2 local grid plus the global path.
        assert_eq!(proba.flops[0], 2.0 * 4.0 + 2.0 * 4.0);
    }

    #[test]
    fn static_mode_builds_no_estimator() {
        let config = ActConfig::default().with_mode(AdaptationMode::Static);
        let built = build_estimator("b/unit_1", 4, &config, BatchNormSettings::default(), None).unwrap();
        assert!(built.is_none());
        let config = config.with_mode(AdaptationMode::Sact);
        let built = build_estimator("b/unit_1", 4, &config, BatchNormSettings::default(), None).unwrap();
        assert!(built.is_some());
    }
}
