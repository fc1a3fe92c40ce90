use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

const DEFAULT_SEED: u64 = 42;

/// Seeding policy used by every parameter initialiser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterminismConfig {
    /// When set, generators without an explicit seed derive one from `base_seed`.
    pub enabled: bool,
    /// Base seed mixed with the component label.
    pub base_seed: u64,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_seed: DEFAULT_SEED,
        }
    }
}

impl DeterminismConfig {
    /// Reads `SPIRAL_DETERMINISTIC` and `SPIRAL_DETERMINISTIC_SEED`.
    pub fn from_env() -> Self {
        let enabled = std::env::var("SPIRAL_DETERMINISTIC")
            .ok()
            .map(|v| !matches!(v.trim(), "" | "0" | "false" | "False" | "off" | "OFF"))
            .unwrap_or(false);
        let base_seed = std::env::var("SPIRAL_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_SEED);
        Self { enabled, base_seed }
    }

    /// Derives a stable seed for a component label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        mix_seed(self.base_seed, label)
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the process configuration, reading the environment on first use.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(DeterminismConfig::from_env)
}

/// Installs an explicit configuration. Has no effect once `config()` has been read.
pub fn configure(cfg: DeterminismConfig) -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| cfg)
}

fn mix_seed<L: Hash>(seed: u64, label: L) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

/// Returns a generator for `label`.
///
/// An explicit seed always wins and is mixed with the label so that sibling
/// layers built from one model seed still draw different weights. Without a
/// seed the process configuration decides between a derived seed and OS
/// entropy.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(mix_seed(value, label)),
        None => {
            let cfg = config();
            if cfg.enabled {
                StdRng::seed_from_u64(cfg.seed_for(label))
            } else {
                StdRng::from_entropy()
            }
        }
    }
}
