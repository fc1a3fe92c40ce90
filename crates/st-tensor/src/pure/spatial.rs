// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Spatial helpers shared by convolutions, pooling and halting maps.

use super::{PureResult, TensorError};
use ndarray::{Array3, ArrayView3};

/// Padding layout for one spatial axis under `SAME` semantics.
///
/// The output length is `ceil(input / stride)` and the total padding is split
/// with the smaller half placed before the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamePadding {
    pub output: usize,
    pub before: usize,
    pub after: usize,
}

impl SamePadding {
    pub fn new(input: usize, kernel: usize, stride: usize) -> PureResult<Self> {
        if input == 0 {
            return Err(TensorError::EmptyInput("same_padding_input"));
        }
        if kernel == 0 || stride == 0 {
            return Err(TensorError::InvalidValue {
                label: "same_padding_window",
            });
        }
        let output = input.div_ceil(stride);
        let needed = (output - 1) * stride + kernel;
        let total = needed.saturating_sub(input);
        let before = total / 2;
        Ok(Self {
            output,
            before,
            after: total - before,
        })
    }
}

/// Source index for nearest-neighbour resizing without corner alignment.
#[inline]
pub fn nearest_index(dst: usize, input: usize, output: usize) -> usize {
    if output == 0 || input == 0 {
        return 0;
    }
    ((dst * input) / output).min(input - 1)
}

/// Resizes a `batch × h × w` map to `out_h × out_w` with nearest sampling.
pub fn resize_nearest_map(
    map: ArrayView3<'_, f32>,
    out_h: usize,
    out_w: usize,
) -> PureResult<Array3<f32>> {
    let (batch, in_h, in_w) = map.dim();
    if batch == 0 || in_h == 0 || in_w == 0 {
        return Err(TensorError::EmptyInput("resize_nearest_map"));
    }
    if out_h == 0 || out_w == 0 {
        return Err(TensorError::InvalidShape {
            shape: vec![batch, out_h, out_w],
        });
    }
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(map.to_owned());
    }
    Ok(Array3::from_shape_fn((batch, out_h, out_w), |(n, y, x)| {
        map[[
            n,
            nearest_index(y, in_h, out_h),
            nearest_index(x, in_w, out_w),
        ]]
    }))
}
