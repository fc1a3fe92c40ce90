// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-image floating point operation accounting.
//!
//! Only convolutions are metered. A convolution producing `P` counted output
//! positions costs `2 · kh · kw · c_in · c_out · P` operations per image (one
//! multiply and one add per weight). Batch normalisation, activations,
//! pooling and bias additions are free.

use ndarray::{Array1, Array3, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use st_tensor::{resize_nearest_map, PureResult, TensorError};

/// FLOPs spent on each image of a batch.
pub type Flops = Array1<f64>;

pub fn zero_flops(batch: usize) -> Flops {
    Array1::zeros(batch)
}

/// Adds `step` to `total` image by image.
pub fn accumulate_flops(total: &mut Flops, step: &Flops) -> PureResult<()> {
    if total.len() != step.len() {
        return Err(TensorError::ShapeMismatch {
            left: vec![total.len()],
            right: vec![step.len()],
        });
    }
    *total += step;
    Ok(())
}

/// FLOPs of a dense convolution evaluated at `positions` output cells.
pub fn conv2d_flops(
    kernel: (usize, usize),
    in_channels: usize,
    out_channels: usize,
    positions: f64,
) -> f64 {
    2.0 * (kernel.0 * kernel.1 * in_channels * out_channels) as f64 * positions
}

/// How a continuous residual mask translates into counted output positions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskedFlopPolicy {
    /// Every position whose mask is strictly positive costs a full evaluation.
    #[default]
    ActivePositions,
    /// Each position is weighted by its mask value.
    MaskMass,
}

impl MaskedFlopPolicy {
    fn weight(self, value: f32) -> f64 {
        match self {
            MaskedFlopPolicy::ActivePositions => {
                if value > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            MaskedFlopPolicy::MaskMass => f64::from(value.clamp(0.0, 1.0)),
        }
    }
}

/// Spatial output mask handed to a convolution to restrict FLOP counting.
#[derive(Clone, Copy, Debug)]
pub struct OutputMask<'a> {
    values: ArrayView3<'a, f32>,
    policy: MaskedFlopPolicy,
}

impl<'a> OutputMask<'a> {
    pub fn new(values: ArrayView3<'a, f32>, policy: MaskedFlopPolicy) -> Self {
        Self { values, policy }
    }

    pub fn values(&self) -> ArrayView3<'a, f32> {
        self.values
    }

    pub fn policy(&self) -> MaskedFlopPolicy {
        self.policy
    }

    /// `(batch, height, width)` of the mask.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.values.dim()
    }

    /// Counted output positions per image for a `batch × out_h × out_w` output.
    pub fn counted_positions(
        &self,
        batch: usize,
        out_h: usize,
        out_w: usize,
    ) -> PureResult<Array1<f64>> {
        let (n, h, w) = self.values.dim();
        if (n, h, w) != (batch, out_h, out_w) {
            return Err(TensorError::ShapeMismatch {
                left: vec![n, h, w],
                right: vec![batch, out_h, out_w],
            });
        }
        let policy = self.policy;
        Ok(self
            .values
            .axis_iter(Axis(0))
            .map(|image| image.iter().map(|&v| policy.weight(v)).sum::<f64>())
            .collect())
    }
}

/// Mask values resampled to `h × w`, or `None` when the mask already has
/// that resolution.
pub fn resize_mask(mask: &OutputMask<'_>, h: usize, w: usize) -> PureResult<Option<Array3<f32>>> {
    let (_, mh, mw) = mask.dim();
    if (mh, mw) == (h, w) {
        return Ok(None);
    }
    resize_nearest_map(mask.values(), h, w).map(Some)
}
