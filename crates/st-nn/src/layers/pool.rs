// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use st_tensor::SamePadding;
use ndarray::{s, Array4};

/// Spatial max pooling with `SAME` padding. Padded cells never win the max.
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    kernel: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(kernel: usize, stride: usize) -> PureResult<Self> {
        if kernel == 0 || stride == 0 {
            return Err(TensorError::InvalidValue {
                label: "maxpool_window",
            });
        }
        Ok(Self { kernel, stride })
    }

    pub fn output_hw(&self, input_hw: (usize, usize)) -> PureResult<(usize, usize)> {
        let rows = SamePadding::new(input_hw.0, self.kernel, self.stride)?;
        let cols = SamePadding::new(input_hw.1, self.kernel, self.stride)?;
        Ok((rows.output, cols.output))
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let [batch, h, w, channels] = input.shape();
        let rows = SamePadding::new(h, self.kernel, self.stride)?;
        let cols = SamePadding::new(w, self.kernel, self.stride)?;
        let padded = input.pad_spatial(
            rows.before,
            rows.after,
            cols.before,
            cols.after,
            f32::NEG_INFINITY,
        );
        let source = padded.array();
        let (k, stride) = (self.kernel, self.stride);
        let data = Array4::from_shape_fn((batch, rows.output, cols.output, channels), |(b, y, x, c)| {
            source
                .slice(s![b, y * stride..y * stride + k, x * stride..x * stride + k, c])
                .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
        });
        Tensor::from_array(data)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}
