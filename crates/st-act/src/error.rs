// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use st_tensor::TensorError;
use std::path::PathBuf;

pub type ActResult<T> = Result<T, ActError>;

/// Errors raised while building or running adaptive-computation blocks and
/// their downstream consumers.
#[derive(Debug, thiserror::Error)]
pub enum ActError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("invalid configuration for `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("unknown heatmap metric `{0}`; expected `ponder_cost` or `num_units`")]
    UnknownMetric(String),
    #[error("unknown adaptation mode `{0}`; expected `static`, `act`, `act_early_stopping` or `sact`")]
    UnknownMode(String),
    #[error("block `{scope}` has no units")]
    EmptyBlock { scope: String },
    #[error("block `{scope}` needs {expected} halting estimators, found {found}")]
    EstimatorCount {
        scope: String,
        expected: usize,
        found: usize,
    },
    #[error("non-finite halting probability {value} in `{scope}` at unit {unit}")]
    NonFiniteProbability {
        scope: String,
        unit: usize,
        value: f32,
    },
    #[error("end points do not contain block `{0}`")]
    MissingBlock(String),
    #[error("end points are missing `{0}`")]
    MissingEndPoint(&'static str),
    #[error("batch size {batch_size} must be positive and divide {num_samples} samples")]
    IndivisibleBatches {
        num_samples: usize,
        batch_size: usize,
    },
    #[error("batch {index} is outside the {num_batches} export batches")]
    BatchOutOfRange { index: usize, num_batches: usize },
    #[error("evaluation export incomplete: {written} of {expected} batches written")]
    IncompleteExport { written: usize, expected: usize },
    #[error("dataset `{name}` expects rows of shape {expected:?}, got {found:?}")]
    DatasetShape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode evaluation record {path:?}: {source}")]
    Bincode {
        path: PathBuf,
        #[source]
        source: bincode::Error,
    },
}
