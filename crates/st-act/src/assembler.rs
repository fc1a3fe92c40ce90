// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::config::{ActConfig, AdaptationMode};
use crate::controller::AdaptiveComputation;
use crate::end_points::{BlockEndPoints, EndPoints};
use crate::error::ActResult;
use crate::unit::Block;
use st_tensor::Tensor;
use tracing::trace;

/// Threads activations through a sequence of blocks, running each one the
/// way the adaptation mode dictates and recording its end points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlockAssembler {
    mode: AdaptationMode,
    controller: AdaptiveComputation,
}

impl BlockAssembler {
    pub fn new(mode: AdaptationMode, controller: AdaptiveComputation) -> Self {
        Self { mode, controller }
    }

    pub fn from_config(config: &ActConfig) -> Self {
        Self::new(
            config.mode,
            AdaptiveComputation::new(config.epsilon, config.flop_policy),
        )
    }

    pub fn mode(&self) -> AdaptationMode {
        self.mode
    }

    pub fn controller(&self) -> &AdaptiveComputation {
        &self.controller
    }

    /// Runs `blocks` in order on `input` and returns the last block's output.
    pub fn stack(
        &self,
        input: &Tensor,
        blocks: &[Block],
        end_points: &mut EndPoints,
    ) -> ActResult<Tensor> {
        let mut net = input.clone();
        for block in blocks {
            let record = match self.mode.halting_variant() {
                None => {
                    let (output, flops) = block.forward_static(&net)?;
                    BlockEndPoints::static_block(block.scope(), block.num_units(), output, flops)
                }
                Some(variant) => {
                    let outcome = self.controller.run(block, &net, variant)?;
                    BlockEndPoints::from_outcome(block.scope(), block.num_units(), outcome)
                }
            };
            trace!(scope = block.scope(), shape = ?record.output.shape(), "block done");
            net = record.output.clone();
            end_points.push_block(record)?;
        }
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::halting::HaltingEstimator;
    use crate::testing::{ConstantEstimator, ShiftUnit};
    use crate::error::ActError;
    use crate::unit::ResidualUnit;
    use st_tensor::TensorError;

    fn blocks() -> Vec<Block> {
        ["block1", "block2"]
            .into_iter()
            .map(|scope| {
                Block::new(scope, &[(); 3], |_, _| {
                    Ok(Box::new(ShiftUnit::new(1, 1.0)) as Box<dyn ResidualUnit>)
                })
                .unwrap()
                .attach_estimators(|_, _| {
                    Ok(Some(
                        Box::new(ConstantEstimator::new(0.6)) as Box<dyn HaltingEstimator>
                    ))
                })
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn static_mode_runs_every_unit() {
        let config = ActConfig::default().with_mode(AdaptationMode::Static);
        let input = Tensor::zeros([2, 1, 1, 1]).unwrap();
        let mut end_points = EndPoints::new(2);
        let output = BlockAssembler::from_config(&config)
            .stack(&input, &blocks(), &mut end_points)
            .unwrap();
        assert!(output.to_vec().iter().all(|&v| v == 6.0));
        assert_eq!(end_points.blocks().len(), 2);
        assert!(end_points.blocks()[0].ponder_cost.is_none());
        assert_eq!(
            end_points.flops().to_vec(),
            vec![6.0 * ShiftUnit::FLOPS_PER_POSITION; 2]
        );
    }

    #[test]
    fn end_points_batch_must_match_the_input() {
        let input = Tensor::zeros([2, 1, 1, 1]).unwrap();
        let mut end_points = EndPoints::new(1);
        let result = BlockAssembler::from_config(&ActConfig::default())
            .stack(&input, &blocks(), &mut end_points);
        assert!(matches!(
            result,
            Err(ActError::Tensor(TensorError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn adaptive_mode_records_each_block() {
        let input = Tensor::zeros([2, 1, 1, 1]).unwrap();
        let mut end_points = EndPoints::new(2);
        BlockAssembler::from_config(&ActConfig::default())
            .stack(&input, &blocks(), &mut end_points)
            .unwrap();
        // 0.6 + 0.6 crosses the threshold at the second unit.
        for block in end_points.blocks() {
            assert!(block.num_units.iter().all(|&n| n == 2));
            assert!(block.halting_distribution.is_some());
        }
        assert_eq!(
            end_points.flops().to_vec(),
            vec![4.0 * ShiftUnit::FLOPS_PER_POSITION; 2]
        );
    }
}
