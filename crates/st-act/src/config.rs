// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::controller::HaltingVariant;
use crate::error::{ActError, ActResult};
use serde::{Deserialize, Serialize};
use st_nn::MaskedFlopPolicy;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Kernel of the local SACT halting convolution.
pub const SACT_KERNEL_SIZE: usize = 3;
/// Initial bias of the halting logits, i.e. `sigmoid(-3) ≈ 0.047` per unit.
pub const INIT_BIAS: f32 = -3.0;
pub const DEFAULT_EPSILON: f32 = 0.01;

/// How a block decides how many units to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationMode {
    /// Every unit runs for every element.
    Static,
    /// One halting decision per image.
    #[default]
    Act,
    /// ACT that stops iterating once the whole batch has halted.
    ActEarlyStopping,
    /// One halting decision per spatial position.
    Sact,
}

impl AdaptationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdaptationMode::Static => "static",
            AdaptationMode::Act => "act",
            AdaptationMode::ActEarlyStopping => "act_early_stopping",
            AdaptationMode::Sact => "sact",
        }
    }

    /// Controller variant driving the block, `None` for static execution.
    pub fn halting_variant(&self) -> Option<HaltingVariant> {
        match self {
            AdaptationMode::Static => None,
            AdaptationMode::Act => Some(HaltingVariant::Act),
            AdaptationMode::ActEarlyStopping => Some(HaltingVariant::ActEarlyStopping),
            AdaptationMode::Sact => Some(HaltingVariant::Sact),
        }
    }

    pub fn is_adaptive(&self) -> bool {
        self.halting_variant().is_some()
    }
}

impl fmt::Display for AdaptationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdaptationMode {
    type Err = ActError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "static" | "none" => Ok(AdaptationMode::Static),
            "act" => Ok(AdaptationMode::Act),
            "act_early_stopping" => Ok(AdaptationMode::ActEarlyStopping),
            "sact" => Ok(AdaptationMode::Sact),
            _ => Err(ActError::UnknownMode(s.to_string())),
        }
    }
}

/// Knobs of the adaptive-computation machinery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActConfig {
    pub mode: AdaptationMode,
    /// Halting threshold slack: an element halts once its cumulative
    /// probability reaches `1 − epsilon`.
    pub epsilon: f32,
    pub sact_kernel_size: usize,
    pub init_bias: f32,
    /// Resolution of the local SACT halting path; `None` keeps the block's.
    pub sact_resolution: Option<(usize, usize)>,
    pub flop_policy: MaskedFlopPolicy,
    pub ponder_cost_weight: f32,
}

impl Default for ActConfig {
    fn default() -> Self {
        Self {
            mode: AdaptationMode::default(),
            epsilon: DEFAULT_EPSILON,
            sact_kernel_size: SACT_KERNEL_SIZE,
            init_bias: INIT_BIAS,
            sact_resolution: None,
            flop_policy: MaskedFlopPolicy::default(),
            ponder_cost_weight: 1.0,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ActError {
    ActError::InvalidConfig {
        field,
        reason: reason.into(),
    }
}

impl ActConfig {
    pub fn with_mode(mut self, mode: AdaptationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn validate(&self) -> ActResult<()> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 || self.epsilon >= 1.0 {
            return Err(invalid("epsilon", format!("{} is not in (0, 1)", self.epsilon)));
        }
        if self.sact_kernel_size == 0 {
            return Err(invalid("sact_kernel_size", "must be positive"));
        }
        if !self.init_bias.is_finite() {
            return Err(invalid("init_bias", "must be finite"));
        }
        if let Some((h, w)) = self.sact_resolution {
            if h == 0 || w == 0 {
                return Err(invalid(
                    "sact_resolution",
                    format!("({h}, {w}) has a zero extent"),
                ));
            }
        }
        if !self.ponder_cost_weight.is_finite() || self.ponder_cost_weight < 0.0 {
            return Err(invalid(
                "ponder_cost_weight",
                format!("{} must be a non-negative number", self.ponder_cost_weight),
            ));
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Reads and validates a JSON config; missing fields take their defaults.
    pub fn from_json_path(path: impl AsRef<Path>) -> ActResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ActError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&text).map_err(|source| ActError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = ActConfig::default();
        config.validate().unwrap();
        assert_eq!(config.epsilon, 0.01);
        assert_eq!(config.sact_kernel_size, 3);
        assert_eq!(config.init_bias, -3.0);
        assert_eq!(config.mode, AdaptationMode::Act);
    }

    #[test]
    fn invalid_values_are_rejected_before_use() {
        let mut config = ActConfig::default();
        config.epsilon = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ActError::InvalidConfig { field: "epsilon", .. })
        ));
        let config = ActConfig {
            sact_resolution: Some((0, 7)),
            ..ActConfig::default()
        };
        assert!(config.validate().is_err());
        let config = ActConfig {
            ponder_cost_weight: -0.5,
            ..ActConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn modes_parse_from_cli_spellings() {
        assert_eq!("sact".parse::<AdaptationMode>().unwrap(), AdaptationMode::Sact);
        assert_eq!(
            "act-early-stopping".parse::<AdaptationMode>().unwrap(),
            AdaptationMode::ActEarlyStopping
        );
        assert_eq!(AdaptationMode::Static.halting_variant(), None);
        assert!(matches!(
            "dense".parse::<AdaptationMode>(),
            Err(ActError::UnknownMode(_))
        ));
    }

    #[test]
    fn json_config_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("act.json");
        std::fs::write(
            &path,
            r#"{"mode": "sact", "sact_resolution": [7, 7], "flop_policy": "mask_mass"}"#,
        )
        .unwrap();
        let config = ActConfig::from_json_path(&path).unwrap();
        assert_eq!(config.mode, AdaptationMode::Sact);
        assert_eq!(config.sact_resolution, Some((7, 7)));
        assert_eq!(config.flop_policy, MaskedFlopPolicy::MaskMass);
        assert_eq!(config.epsilon, DEFAULT_EPSILON);

        std::fs::write(&path, r#"{"epsilon": 2.0}"#).unwrap();
        assert!(ActConfig::from_json_path(&path).is_err());
        assert!(matches!(
            ActConfig::from_json_path(dir.path().join("missing.json")),
            Err(ActError::Io { .. })
        ));
    }
}
