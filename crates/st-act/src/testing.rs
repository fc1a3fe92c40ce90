// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter-free units and estimators with scripted behaviour, used to pin
//! down controller semantics in tests and benchmarks.

use crate::halting::{HaltingEstimator, HaltingProbability};
use crate::unit::ResidualUnit;
use ndarray::{Array1, Array3};
use st_nn::{Flops, Module, OutputMask, Parameter};
use st_tensor::{PureResult, Tensor, TensorError};

/// Adds a constant residual to every element. The residual is scaled by the
/// residual mask when one is given, and each counted position costs
/// [`ShiftUnit::FLOPS_PER_POSITION`].
#[derive(Debug, Clone)]
pub struct ShiftUnit {
    channels: usize,
    shift: f32,
}

impl ShiftUnit {
    pub const FLOPS_PER_POSITION: f64 = 10.0;

    pub fn new(channels: usize, shift: f32) -> Self {
        Self { channels, shift }
    }
}

impl ResidualUnit for ShiftUnit {
    fn forward_masked(
        &self,
        input: &Tensor,
        mask: Option<&OutputMask<'_>>,
    ) -> PureResult<(Tensor, Flops)> {
        let [batch, h, w, _] = input.shape();
        let residual = Tensor::full(input.shape(), self.shift)?;
        let (residual, positions) = match mask {
            Some(mask) => (
                residual.mul_map(&mask.values())?,
                mask.counted_positions(batch, h, w)?,
            ),
            None => (residual, Array1::from_elem(batch, (h * w) as f64)),
        };
        Ok((
            input.add(&residual)?,
            positions.mapv(|p| p * Self::FLOPS_PER_POSITION),
        ))
    }

    fn output_channels(&self) -> usize {
        self.channels
    }
}

impl Module for ShiftUnit {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.forward_masked(input, None).map(|(output, _)| output)
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

/// Returns the same probability for every image, or for every position when
/// spatial.
#[derive(Debug, Clone)]
pub struct ConstantEstimator {
    probability: f32,
    spatial: bool,
}

impl ConstantEstimator {
    pub fn new(probability: f32) -> Self {
        Self {
            probability,
            spatial: false,
        }
    }

    pub fn spatial(probability: f32) -> Self {
        Self {
            probability,
            spatial: true,
        }
    }
}

impl HaltingEstimator for ConstantEstimator {
    fn estimate(
        &self,
        outputs: &Tensor,
        _mask: Option<&OutputMask<'_>>,
    ) -> PureResult<HaltingProbability> {
        let batch = outputs.batch();
        let (h, w) = if self.spatial {
            outputs.spatial()
        } else {
            (1, 1)
        };
        Ok(HaltingProbability {
            map: Array3::from_elem((batch, h, w), self.probability),
            flops: Array1::zeros(batch),
        })
    }
}

impl Module for ConstantEstimator {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Tensor::from_map(self.estimate(input, None)?.map)
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

/// Returns a fixed map regardless of the unit output; the map's batch must
/// match.
#[derive(Debug, Clone)]
pub struct MapEstimator {
    map: Array3<f32>,
    flops_per_image: f64,
}

impl MapEstimator {
    pub fn new(map: Array3<f32>) -> Self {
        Self {
            map,
            flops_per_image: 0.0,
        }
    }

    pub fn with_flops(mut self, flops_per_image: f64) -> Self {
        self.flops_per_image = flops_per_image;
        self
    }
}

impl HaltingEstimator for MapEstimator {
    fn estimate(
        &self,
        outputs: &Tensor,
        _mask: Option<&OutputMask<'_>>,
    ) -> PureResult<HaltingProbability> {
        let (n, h, w) = self.map.dim();
        if n != outputs.batch() {
            return Err(TensorError::ShapeMismatch {
                left: vec![n, h, w],
                right: outputs.shape().to_vec(),
            });
        }
        Ok(HaltingProbability {
            map: self.map.clone(),
            flops: Array1::from_elem(n, self.flops_per_image),
        })
    }
}

impl Module for MapEstimator {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        Tensor::from_map(self.estimate(input, None)?.map)
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
