// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::controller::HaltingOutcome;
use crate::error::{ActError, ActResult};
use ndarray::{Array3, Array4};
use st_nn::{accumulate_flops, zero_flops, Flops};
use st_tensor::Tensor;

/// What one block reports after a forward pass.
#[derive(Clone, Debug)]
pub struct BlockEndPoints {
    pub scope: String,
    /// Number of units the block owns.
    pub max_units: usize,
    /// `None` for static blocks.
    pub ponder_cost: Option<Array3<f32>>,
    pub num_units: Array3<u32>,
    pub flops: Flops,
    /// `None` for static blocks.
    pub halting_distribution: Option<Array4<f32>>,
    pub output: Tensor,
}

impl BlockEndPoints {
    pub fn from_outcome(scope: impl Into<String>, max_units: usize, outcome: HaltingOutcome) -> Self {
        Self {
            scope: scope.into(),
            max_units,
            ponder_cost: Some(outcome.ponder_cost),
            num_units: outcome.num_units,
            flops: outcome.flops,
            halting_distribution: Some(outcome.halting_distribution),
            output: outcome.output,
        }
    }

    /// Every unit ran for every image.
    pub fn static_block(
        scope: impl Into<String>,
        max_units: usize,
        output: Tensor,
        flops: Flops,
    ) -> Self {
        let batch = output.batch();
        Self {
            scope: scope.into(),
            max_units,
            ponder_cost: None,
            num_units: Array3::from_elem((batch, 1, 1), max_units as u32),
            flops,
            halting_distribution: None,
            output,
        }
    }

    /// Whether the per-element maps carry spatial extent.
    pub fn is_spatial(&self) -> bool {
        let (_, h, w) = self.num_units.dim();
        h * w > 1
    }

    /// Mean ponder cost over the batch and every position.
    pub fn mean_ponder_cost(&self) -> Option<f64> {
        self.ponder_cost
            .as_ref()
            .and_then(|cost| cost.mapv(f64::from).mean())
    }
}

/// Named outputs of a full forward pass: the network inputs, the running
/// per-image FLOP total and one record per block in execution order.
#[derive(Clone, Debug)]
pub struct EndPoints {
    inputs: Option<Tensor>,
    flops: Flops,
    blocks: Vec<BlockEndPoints>,
}

impl EndPoints {
    pub fn new(batch: usize) -> Self {
        Self {
            inputs: None,
            flops: zero_flops(batch),
            blocks: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Tensor) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn inputs(&self) -> ActResult<&Tensor> {
        self.inputs.as_ref().ok_or(ActError::MissingEndPoint("inputs"))
    }

    pub fn batch_size(&self) -> usize {
        self.flops.len()
    }

    pub fn flops(&self) -> &Flops {
        &self.flops
    }

    /// Adds FLOPs spent outside the blocks, e.g. the stem or the head.
    pub fn add_flops(&mut self, flops: &Flops) -> ActResult<()> {
        Ok(accumulate_flops(&mut self.flops, flops)?)
    }

    /// Records a block and adds its FLOPs to the running total.
    pub fn push_block(&mut self, block: BlockEndPoints) -> ActResult<()> {
        accumulate_flops(&mut self.flops, &block.flops)?;
        self.blocks.push(block);
        Ok(())
    }

    pub fn blocks(&self) -> &[BlockEndPoints] {
        &self.blocks
    }

    pub fn block(&self, scope: &str) -> ActResult<&BlockEndPoints> {
        self.blocks
            .iter()
            .find(|block| block.scope == scope)
            .ok_or_else(|| ActError::MissingBlock(scope.to_string()))
    }

    pub fn block_scopes(&self) -> Vec<String> {
        self.blocks.iter().map(|block| block.scope.clone()).collect()
    }

    /// Unit counts of every block, in order.
    pub fn block_num_units(&self) -> Vec<usize> {
        self.blocks.iter().map(|block| block.max_units).collect()
    }

    /// Sum over blocks of the mean ponder cost, scaled by `weight`. Static
    /// blocks contribute nothing.
    pub fn total_ponder_cost(&self, weight: f32) -> f64 {
        self.blocks
            .iter()
            .filter_map(BlockEndPoints::mean_ponder_cost)
            .sum::<f64>()
            * f64::from(weight)
    }
}
