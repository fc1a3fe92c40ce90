// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::flops::{conv2d_flops, Flops, OutputMask};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use ndarray::{s, Array1, Array2, Array4};
use st_tensor::SamePadding;

fn validate_positive(value: usize, label: &'static str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}

/// NHWC 2D convolution with `SAME` padding and per-image FLOP metering.
///
/// Weights are stored as `kh × kw × c_in × c_out` and the optional bias as
/// `1 × 1 × 1 × c_out`. The forward pass lowers the input into an im2col
/// matrix and runs a single dense product.
#[derive(Debug)]
pub struct Conv2d {
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: usize,
    weight: Parameter,
    bias: Option<Parameter>,
}

impl Conv2d {
    /// Creates a bias-free convolution with He-normal weights.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: usize,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        validate_positive(in_channels, "conv_in_channels")?;
        validate_positive(out_channels, "conv_out_channels")?;
        validate_positive(kernel.0, "conv_kernel_h")?;
        validate_positive(kernel.1, "conv_kernel_w")?;
        validate_positive(stride, "conv_stride")?;
        let name = name.into();
        let fan_in = (kernel.0 * kernel.1 * in_channels) as f32;
        let std = (2.0 / fan_in).sqrt();
        let weight_name = format!("{name}::weight");
        let weight = Tensor::random_normal_labelled(
            [kernel.0, kernel.1, in_channels, out_channels],
            0.0,
            std,
            seed,
            &weight_name,
        )?;
        Ok(Self {
            in_channels,
            out_channels,
            kernel,
            stride,
            weight: Parameter::new(weight_name, weight),
            bias: None,
            name,
        })
    }

    /// Adds a bias initialised to `init` on every output channel.
    pub fn with_bias(mut self, init: f32) -> PureResult<Self> {
        if !init.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "conv_bias_init",
                value: init,
            });
        }
        let bias = Tensor::full([1, 1, 1, self.out_channels], init)?;
        self.bias = Some(Parameter::new(format!("{}::bias", self.name), bias));
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    /// Output `(height, width)` for an input of the given spatial size.
    pub fn output_hw(&self, input_hw: (usize, usize)) -> PureResult<(usize, usize)> {
        let rows = SamePadding::new(input_hw.0, self.kernel.0, self.stride)?;
        let cols = SamePadding::new(input_hw.1, self.kernel.1, self.stride)?;
        Ok((rows.output, cols.output))
    }

    /// Per-image FLOPs of a dense evaluation at the given input size.
    pub fn dense_flops(&self, input_hw: (usize, usize)) -> PureResult<f64> {
        let (oh, ow) = self.output_hw(input_hw)?;
        Ok(conv2d_flops(
            self.kernel,
            self.in_channels,
            self.out_channels,
            (oh * ow) as f64,
        ))
    }

    fn im2col(&self, input: &Tensor) -> PureResult<(Array2<f32>, usize, usize)> {
        let [batch, h, w, channels] = input.shape();
        if channels != self.in_channels {
            return Err(TensorError::ShapeMismatch {
                left: input.shape().to_vec(),
                right: vec![batch, h, w, self.in_channels],
            });
        }
        let rows = SamePadding::new(h, self.kernel.0, self.stride)?;
        let cols = SamePadding::new(w, self.kernel.1, self.stride)?;
        let (oh, ow) = (rows.output, cols.output);
        let (kh, kw) = self.kernel;

        if (kh, kw, self.stride) == (1, 1, 1) {
            let patches = input
                .array()
                .view()
                .into_shape((batch * h * w, channels))
                .map_err(|_| TensorError::InvalidShape {
                    shape: input.shape().to_vec(),
                })?
                .to_owned();
            return Ok((patches, oh, ow));
        }

        let padded = input.pad_spatial(rows.before, rows.after, cols.before, cols.after, 0.0);
        let source = padded.array();
        let mut patches = Array2::<f32>::zeros((batch * oh * ow, kh * kw * channels));
        for b in 0..batch {
            for oy in 0..oh {
                for ox in 0..ow {
                    let row = (b * oh + oy) * ow + ox;
                    let mut dst = patches.row_mut(row);
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let iy = oy * self.stride + ky;
                            let ix = ox * self.stride + kx;
                            let offset = (ky * kw + kx) * channels;
                            dst.slice_mut(s![offset..offset + channels])
                                .assign(&source.slice(s![b, iy, ix, ..]));
                        }
                    }
                }
            }
        }
        Ok((patches, oh, ow))
    }

    /// Runs the convolution and reports FLOPs per image. With a mask the
    /// output is still computed densely but only the counted positions are
    /// charged.
    pub fn forward_masked(
        &self,
        input: &Tensor,
        mask: Option<&OutputMask<'_>>,
    ) -> PureResult<(Tensor, Flops)> {
        let batch = input.batch();
        let (patches, oh, ow) = self.im2col(input)?;
        let (kh, kw) = self.kernel;
        let kernel = self
            .weight
            .value()
            .array()
            .view()
            .into_shape((kh * kw * self.in_channels, self.out_channels))
            .map_err(|_| TensorError::InvalidShape {
                shape: self.weight.value().shape().to_vec(),
            })?;
        let product = patches.dot(&kernel);
        let data: Array4<f32> = product
            .into_shape((batch, oh, ow, self.out_channels))
            .map_err(|_| TensorError::InvalidShape {
                shape: vec![batch, oh, ow, self.out_channels],
            })?;
        let mut output = Tensor::from_array(data)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias.value())?;
        }

        let positions = match mask {
            Some(mask) => mask.counted_positions(batch, oh, ow)?,
            None => Array1::from_elem(batch, (oh * ow) as f64),
        };
        let flops = positions.mapv(|p| conv2d_flops(self.kernel, self.in_channels, self.out_channels, p));
        Ok((output, flops))
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.forward_masked(input, None).map(|(output, _)| output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flops::MaskedFlopPolicy;
    use ndarray::Array3;
    use std::collections::HashMap;

    fn ones_kernel(conv: &mut Conv2d) {
        let shape = conv.weight().value().shape();
        let mut state = HashMap::new();
        state.insert(
            format!("{}::weight", conv.name()),
            Tensor::full(shape, 1.0).unwrap(),
        );
        conv.load_state_dict_filtered(&state, &|name| name.ends_with("::weight"))
            .unwrap();
    }

    #[test]
    fn same_padding_sums_neighbourhood() {
        let mut conv = Conv2d::new("conv", 1, 1, (3, 3), 1, Some(0)).unwrap();
        ones_kernel(&mut conv);
        let input = Tensor::full([1, 3, 3, 1], 1.0).unwrap();
        let (output, flops) = conv.forward_masked(&input, None).unwrap();
        assert_eq!(output.shape(), [1, 3, 3, 1]);
        assert_eq!(output.array()[[0, 1, 1, 0]], 9.0);
        assert_eq!(output.array()[[0, 0, 0, 0]], 4.0);
        assert_eq!(flops.to_vec(), vec![2.0 * 9.0 * 9.0]);
    }

    #[test]
    fn strided_output_matches_tensorflow_same() {
        let mut conv = Conv2d::new("down", 2, 3, (3, 3), 2, Some(1)).unwrap();
        ones_kernel(&mut conv);
        let input = Tensor::full([2, 7, 7, 2], 1.0).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), [2, 4, 4, 3]);
        // pad_before = 1, so the first window straddles the border.
        assert_eq!(output.array()[[0, 0, 0, 0]], 8.0);
        assert_eq!(output.array()[[1, 1, 1, 2]], 18.0);
        assert_eq!(conv.dense_flops((7, 7)).unwrap(), 2.0 * 9.0 * 2.0 * 3.0 * 16.0);
    }

    #[test]
    fn pointwise_conv_adds_bias_and_counts_masked_positions() {
        let conv = Conv2d::new("halting", 4, 1, (1, 1), 1, Some(3))
            .unwrap()
            .with_bias(-3.0)
            .unwrap();
        let input = Tensor::zeros([1, 2, 2, 4]).unwrap();
        let mut mask = Array3::<f32>::zeros((1, 2, 2));
        mask[[0, 0, 1]] = 0.2;
        let mask = OutputMask::new(mask.view(), MaskedFlopPolicy::ActivePositions);
        let (output, flops) = conv.forward_masked(&input, Some(&mask)).unwrap();
        assert!(output.to_vec().iter().all(|&v| v == -3.0));
        assert_eq!(flops[0], 2.0 * 4.0);
        assert_eq!(conv.state_dict().unwrap().len(), 2);
    }

    #[test]
    fn channel_mismatch_is_reported() {
        let conv = Conv2d::new("conv", 3, 8, (1, 1), 1, None).unwrap();
        let input = Tensor::zeros([1, 2, 2, 4]).unwrap();
        assert!(matches!(
            conv.forward(&input),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(Conv2d::new("bad", 0, 1, (1, 1), 1, None).is_err());
    }
}
