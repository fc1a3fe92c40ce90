// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Adaptive Computation Time for residual networks.
//!
//! A residual *block* is a stack of units that share one feature resolution.
//! After each unit a halting estimator predicts a probability; the
//! [`AdaptiveComputation`] controller accumulates these probabilities per
//! image (ACT) or per spatial position (SACT) and stops updating an element
//! once its cumulative probability reaches `1 − ε`. The block output is the
//! halting-weighted mixture of the unit outputs and the ponder cost
//! `executed + remainder` is exposed for training.
//!
//! The [`BlockAssembler`] threads activations through a sequence of blocks and
//! records everything downstream consumers need in [`EndPoints`]: metrics,
//! heatmaps, evaluation export and fine-tuning all read from there.

pub mod assembler;
pub mod config;
pub mod controller;
pub mod end_points;
pub mod error;
pub mod export;
pub mod finetune;
pub mod halting;
pub mod metrics;
#[doc(hidden)]
pub mod testing;
pub mod unit;
pub mod visualization;

pub use assembler::BlockAssembler;
pub use config::{ActConfig, AdaptationMode};
pub use controller::{AdaptiveComputation, HaltingOutcome, HaltingState, HaltingVariant};
pub use end_points::{BlockEndPoints, EndPoints};
pub use error::{ActError, ActResult};
pub use export::{
    export_evaluation, num_batches, Dataset, EvaluationRecord, EvaluationWriter,
};
pub use finetune::{is_halting_parameter, FinetuneSettings, HALTING_SCOPE_MARKER};
pub use halting::{
    build_estimator, ConvHaltingEstimator, GlobalHaltingEstimator, HaltingEstimator,
    HaltingProbability,
};
pub use metrics::{
    act_metric_map, flops_metric_map, moments_metric_map, MetricMap, StreamingMetrics,
    TOTAL_FLOPS_NAME,
};
pub use unit::{Block, ResidualUnit};
pub use visualization::{
    heatmap_summaries, sact_image_heatmap, sact_map, HeatmapMetric, HeatmapOptions,
};
