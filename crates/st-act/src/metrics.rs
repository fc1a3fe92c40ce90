// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Scalar summaries of [`EndPoints`].
//!
//! Block metrics are keyed `{scope}/ponder_cost_mean`, `{scope}/num_units_std`
//! and so on; the network total uses `/` as delimiter, giving
//! `Total Flops/mean` and `Total Flops/std`.

use crate::end_points::EndPoints;
use std::collections::BTreeMap;

pub const TOTAL_FLOPS_NAME: &str = "Total Flops";

/// Metric name to value, ordered for stable reports.
pub type MetricMap = BTreeMap<String, f64>;

/// Mean and standard deviation of `values` under `{name}{delimiter}mean` and
/// `{name}{delimiter}std`. An empty input yields zeros.
pub fn moments_metric_map<I>(values: I, name: &str, delimiter: &str) -> MetricMap
where
    I: IntoIterator<Item = f64>,
{
    let values: Vec<f64> = values.into_iter().collect();
    let count = values.len().max(1) as f64;
    let mean = values.iter().sum::<f64>() / count;
    // two-pass
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    let mut map = MetricMap::new();
    map.insert(format!("{name}{delimiter}mean"), mean);
    map.insert(format!("{name}{delimiter}std"), variance.max(0.0).sqrt());
    map
}

/// Ponder cost and unit-count moments per block, plus the largest unit count
/// any element used. Static blocks report unit counts only.
pub fn act_metric_map(end_points: &EndPoints) -> MetricMap {
    let mut map = MetricMap::new();
    for block in end_points.blocks() {
        let scope = &block.scope;
        if let Some(ponder_cost) = &block.ponder_cost {
            map.extend(moments_metric_map(
                ponder_cost.iter().map(|&v| f64::from(v)),
                &format!("{scope}/ponder_cost"),
                "_",
            ));
        }
        map.extend(moments_metric_map(
            block.num_units.iter().map(|&v| f64::from(v)),
            &format!("{scope}/num_units"),
            "_",
        ));
        let executed = block.num_units.iter().copied().max().unwrap_or(0);
        map.insert(format!("{scope}/num_units_executed"), f64::from(executed));
    }
    map
}

/// Per-image FLOP moments for the whole network under `total_name` and for
/// every block.
pub fn flops_metric_map(end_points: &EndPoints, total_name: &str) -> MetricMap {
    let mut map = moments_metric_map(end_points.flops().iter().copied(), total_name, "/");
    for block in end_points.blocks() {
        map.extend(moments_metric_map(
            block.flops.iter().copied(),
            &format!("{}/flops", block.scope),
            "_",
        ));
    }
    map
}

/// Running per-key averages of metric maps across evaluation batches.
#[derive(Clone, Debug, Default)]
pub struct StreamingMetrics {
    totals: BTreeMap<String, (f64, usize)>,
}

impl StreamingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, batch: &MetricMap) {
        for (name, value) in batch {
            let entry = self.totals.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }

    /// Number of updates seen by the most frequently updated metric.
    pub fn batches(&self) -> usize {
        self.totals.values().map(|&(_, n)| n).max().unwrap_or(0)
    }

    pub fn mean(&self) -> MetricMap {
        self.totals
            .iter()
            .map(|(name, &(sum, n))| (name.clone(), sum / n.max(1) as f64))
            .collect()
    }

    pub fn reset(&mut self) {
        self.totals.clear();
    }
}
