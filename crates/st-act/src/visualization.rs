// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Ponder-cost heatmaps over the input images.

use crate::end_points::{BlockEndPoints, EndPoints};
use crate::error::{ActError, ActResult};
use ndarray::{s, Array3, Array4};
use serde::{Deserialize, Serialize};
use st_tensor::{resize_nearest_map, Tensor, TensorError};
use std::fmt;
use std::str::FromStr;

/// Per-element quantity drawn into a heatmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatmapMetric {
    PonderCost,
    NumUnits,
}

impl HeatmapMetric {
    pub const ALL: [HeatmapMetric; 2] = [HeatmapMetric::PonderCost, HeatmapMetric::NumUnits];

    pub fn as_str(&self) -> &'static str {
        match self {
            HeatmapMetric::PonderCost => "ponder_cost",
            HeatmapMetric::NumUnits => "num_units",
        }
    }

    /// Largest value the per-block sum can reach: the total unit count, plus
    /// one remainder per block for ponder cost.
    pub fn max_value(&self, block_num_units: &[usize]) -> f32 {
        let units: usize = block_num_units.iter().sum();
        match self {
            HeatmapMetric::PonderCost => (units + block_num_units.len()) as f32,
            HeatmapMetric::NumUnits => units as f32,
        }
    }

    fn block_map(&self, block: &BlockEndPoints) -> ActResult<Array3<f32>> {
        match self {
            HeatmapMetric::PonderCost => block
                .ponder_cost
                .clone()
                .ok_or(ActError::MissingEndPoint("ponder_cost")),
            HeatmapMetric::NumUnits => Ok(block.num_units.mapv(|n| n as f32)),
        }
    }
}

impl fmt::Display for HeatmapMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeatmapMetric {
    type Err = ActError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ponder_cost" => Ok(HeatmapMetric::PonderCost),
            "num_units" => Ok(HeatmapMetric::NumUnits),
            other => Err(ActError::UnknownMetric(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapOptions {
    pub num_images: usize,
    /// Heatmap opacity in `[0, 1]`.
    pub alpha: f32,
    /// Width in pixels of the black strip between image and overlay.
    pub border: usize,
}

impl Default for HeatmapOptions {
    fn default() -> Self {
        Self {
            num_images: 3,
            alpha: 0.75,
            border: 5,
        }
    }
}

/// Sum over blocks of `metric`, each block map resized to `(h, w)`.
fn summed_maps(
    end_points: &EndPoints,
    metric: HeatmapMetric,
    images: usize,
    (h, w): (usize, usize),
) -> ActResult<Array3<f32>> {
    let mut total = Array3::<f32>::zeros((images, h, w));
    for block in end_points.blocks() {
        let map = metric.block_map(block)?;
        if map.dim().0 < images {
            return Err(TensorError::ShapeMismatch {
                left: vec![images, h, w],
                right: map.shape().to_vec(),
            }
            .into());
        }
        let map = map.slice(s![..images, .., ..]);
        total += &resize_nearest_map(map, h, w)?;
    }
    Ok(total)
}

/// Side-by-side visualisation of the first `options.num_images` inputs.
///
/// Each row is `[image | border | overlay]` where the overlay blends the
/// min-max normalised image with the summed per-block `metric`, drawn in the
/// red channel and scaled by [`HeatmapMetric::max_value`]. The result has
/// shape `images × h × (2w + border) × c`.
pub fn sact_image_heatmap(
    end_points: &EndPoints,
    metric: HeatmapMetric,
    options: &HeatmapOptions,
) -> ActResult<Tensor> {
    if !(0.0..=1.0).contains(&options.alpha) {
        return Err(ActError::InvalidConfig {
            field: "alpha",
            reason: format!("{} is not in [0, 1]", options.alpha),
        });
    }
    let inputs = end_points.inputs()?;
    let [batch, h, w, c] = inputs.shape();
    let images = options.num_images.min(batch);
    if images == 0 {
        return Err(ActError::InvalidConfig {
            field: "num_images",
            reason: "no images to draw".into(),
        });
    }
    let images_tensor = inputs.slice_batch(0..images)?.min_max_normalize();

    let block_num_units = end_points.block_num_units();
    let max_value = metric.max_value(&block_num_units).max(1.0);
    let heat = summed_maps(end_points, metric, images, (h, w))?;
    let mut red = Array4::<f32>::zeros((images, h, w, c));
    red.slice_mut(s![.., .., .., 0]).assign(&heat);
    let red = Tensor::from_array(red)?;

    let overlay = images_tensor
        .scale(1.0 - options.alpha)
        .add(&red.scale(options.alpha / max_value))?;
    if options.border == 0 {
        return Ok(Tensor::concat(2, &[&images_tensor, &overlay])?);
    }
    let border = Tensor::zeros([images, h, options.border, c])?;
    Ok(Tensor::concat(2, &[&images_tensor, &border, &overlay])?)
}

/// Sum over blocks of `metric` resized to the input resolution, for the whole
/// batch.
pub fn sact_map(end_points: &EndPoints, metric: HeatmapMetric) -> ActResult<Array3<f32>> {
    let inputs = end_points.inputs()?;
    let [batch, h, w, _] = inputs.shape();
    summed_maps(end_points, metric, batch, (h, w))
}

/// `heatmaps/ponder_cost` and `heatmaps/num_units` images.
pub fn heatmap_summaries(
    end_points: &EndPoints,
    options: &HeatmapOptions,
) -> ActResult<Vec<(String, Tensor)>> {
    HeatmapMetric::ALL
        .iter()
        .map(|&metric| {
            Ok((
                format!("heatmaps/{metric}"),
                sact_image_heatmap(end_points, metric, options)?,
            ))
        })
        .collect()
}
