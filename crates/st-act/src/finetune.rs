// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Fine-tuning an adaptive network from a checkpoint of its backbone.
//!
//! Everything outside the halting scopes is restored; halting parameters keep
//! their fresh initialisation and train with a learning-rate multiplier.

use crate::error::ActResult;
use st_nn::{io, Module, ParameterRegistry};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name fragment shared by every halting-estimator parameter.
pub const HALTING_SCOPE_MARKER: &str = "/halting_proba/";

pub fn is_halting_parameter(name: &str) -> bool {
    name.contains(HALTING_SCOPE_MARKER)
}

#[derive(Clone, Debug, PartialEq)]
pub struct FinetuneSettings {
    checkpoint: PathBuf,
    restore: Vec<String>,
    fast: Vec<String>,
    lr_coeff: f32,
}

impl FinetuneSettings {
    /// `None` when no checkpoint is given.
    pub fn from_registry(
        checkpoint: Option<&Path>,
        registry: &ParameterRegistry,
        lr_coeff: f32,
    ) -> Option<Self> {
        let checkpoint = checkpoint?;
        warn!("Finetuning from {}", checkpoint.display());
        let (halting, backbone) = registry.partition(is_halting_parameter);
        let restore: Vec<String> = backbone.names().map(str::to_string).collect();
        let fast: Vec<String> = halting
            .trainable()
            .map(|entry| entry.name.clone())
            .collect();
        info!("Restoring variables: {}", restore.join(", "));
        info!("Training with {}x LR: {}", lr_coeff, fast.join(", "));
        Some(Self {
            checkpoint: checkpoint.to_path_buf(),
            restore,
            fast,
            lr_coeff,
        })
    }

    pub fn for_module<M: Module + ?Sized>(
        checkpoint: Option<&Path>,
        module: &M,
        lr_coeff: f32,
    ) -> ActResult<Option<Self>> {
        let registry = ParameterRegistry::from_module(module)?;
        Ok(Self::from_registry(checkpoint, &registry, lr_coeff))
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    /// Parameters and buffers loaded from the checkpoint.
    pub fn restored(&self) -> &[String] {
        &self.restore
    }

    /// Trainable halting parameters.
    pub fn fast(&self) -> &[String] {
        &self.fast
    }

    pub fn lr_coeff(&self) -> f32 {
        self.lr_coeff
    }

    pub fn gradient_multipliers(&self) -> BTreeMap<String, f32> {
        self.fast
            .iter()
            .map(|name| (name.clone(), self.lr_coeff))
            .collect()
    }

    /// Loads every non-halting parameter of `module` from the checkpoint; the
    /// format follows the file extension. Returns how many were loaded.
    pub fn restore<M: Module + ?Sized>(&self, module: &mut M) -> ActResult<usize> {
        let state = io::load_state_dict(&self.checkpoint)?;
        module.load_state_dict_filtered(&state, &|name: &str| !is_halting_parameter(name))?;
        Ok(self.restore.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActConfig, AdaptationMode};
    use crate::halting::{build_estimator, HaltingEstimator};
    use st_nn::{BatchNormSettings, Conv2d};
    use tempfile::tempdir;

    fn estimator(mode: AdaptationMode, seed: u64) -> Box<dyn HaltingEstimator> {
        let config = ActConfig::default().with_mode(mode);
        build_estimator("block1/unit_1", 4, &config, BatchNormSettings::default(), Some(seed))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn settings_are_absent_without_checkpoint() {
        let conv = Conv2d::new("block1/unit_1/conv1", 4, 4, (1, 1), 1, Some(0)).unwrap();
        assert!(FinetuneSettings::for_module(None, &conv, 10.0).unwrap().is_none());
    }

    #[test]
    fn halting_parameters_train_fast_and_are_not_restored() {
        let estimator = estimator(AdaptationMode::Act, 3);
        let registry = ParameterRegistry::from_module(estimator.as_ref()).unwrap();
        let mut entries = registry.entries().to_vec();
        entries.extend(
            ParameterRegistry::from_module(
                &Conv2d::new("block1/unit_1/bottleneck/conv1", 4, 4, (1, 1), 1, Some(0)).unwrap(),
            )
            .unwrap()
            .entries()
            .iter()
            .cloned(),
        );
        let registry = ParameterRegistry::from_entries(entries);
        let settings =
            FinetuneSettings::from_registry(Some(Path::new("ckpt.bin")), &registry, 10.0).unwrap();
        assert_eq!(settings.restored(), ["block1/unit_1/bottleneck/conv1::weight"]);
        // gamma, beta and the conv weight and bias; moving statistics are buffers.
        assert_eq!(settings.fast().len(), 4);
        assert!(settings.fast().iter().all(|name| is_halting_parameter(name)));
        assert!(settings
            .gradient_multipliers()
            .values()
            .all(|&coeff| coeff == 10.0));
    }

    #[test]
    fn restore_skips_halting_parameters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ckpt.json");
        let source = estimator(AdaptationMode::Sact, 1);
        let mut state = source.state_dict().unwrap();
        let backbone = Conv2d::new("block1/unit_1/bottleneck/conv1", 4, 4, (1, 1), 1, Some(5)).unwrap();
        state.extend(backbone.state_dict().unwrap());
        io::save_state_dict(&state, &path).unwrap();

        let mut target = Conv2d::new("block1/unit_1/bottleneck/conv1", 4, 4, (1, 1), 1, Some(6)).unwrap();
        let settings = FinetuneSettings::for_module(Some(path.as_path()), &target, 1.0)
            .unwrap()
            .unwrap();
        assert_eq!(settings.restore(&mut target).unwrap(), 1);
        assert_eq!(target.weight(), backbone.weight());

        let mut fresh = estimator(AdaptationMode::Sact, 2);
        let before = fresh.state_dict().unwrap();
        let settings = FinetuneSettings::for_module(Some(path.as_path()), fresh.as_ref(), 1.0)
            .unwrap()
            .unwrap();
        assert!(settings.restored().is_empty());
        settings.restore(fresh.as_mut()).unwrap();
        assert_eq!(fresh.state_dict().unwrap(), before);
    }
}
