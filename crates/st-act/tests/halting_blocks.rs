// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use st_act::testing::{MapEstimator, ShiftUnit};
use st_act::{
    AdaptiveComputation, Block, HaltingEstimator, HaltingOutcome, HaltingVariant, ResidualUnit,
};
use st_nn::MaskedFlopPolicy;
use st_tensor::Tensor;

const UNITS: usize = 5;

fn random_maps(seed: u64, dim: (usize, usize, usize)) -> Vec<Array3<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..UNITS - 1)
        .map(|_| Array3::from_shape_simple_fn(dim, || rng.gen_range(0.0..0.6)))
        .collect()
}

fn block(maps: &[Array3<f32>], estimator_flops: f64) -> Block {
    Block::new("block1", &[(); UNITS], |_, _| {
        Ok(Box::new(ShiftUnit::new(1, 1.0)) as Box<dyn ResidualUnit>)
    })
    .unwrap()
    .with_estimators(
        maps.iter()
            .map(|map| {
                Box::new(MapEstimator::new(map.clone()).with_flops(estimator_flops))
                    as Box<dyn HaltingEstimator>
            })
            .collect(),
    )
    .unwrap()
}

fn run(block: &Block, input: &Tensor, variant: HaltingVariant, epsilon: f32) -> HaltingOutcome {
    AdaptiveComputation::new(epsilon, MaskedFlopPolicy::ActivePositions)
        .run(block, input, variant)
        .unwrap()
}

#[test]
fn halting_weights_form_a_distribution() {
    let input = Tensor::zeros([4, 3, 3, 1]).unwrap();
    for (variant, dim) in [
        (HaltingVariant::Act, (4, 1, 1)),
        (HaltingVariant::ActEarlyStopping, (4, 1, 1)),
        (HaltingVariant::Sact, (4, 3, 3)),
    ] {
        let block = block(&random_maps(17, dim), 0.0);
        let outcome = run(&block, &input, variant, 0.01);
        assert_eq!(outcome.halting_distribution.dim(), (dim.0, dim.1, dim.2, UNITS));
        for weights in outcome.halting_distribution.lanes(Axis(3)) {
            assert!(weights.iter().all(|&w| w >= 0.0));
            assert!((weights.sum() - 1.0).abs() < 1e-5, "{variant:?}: {weights}");
        }
        for (&cost, &units) in outcome.ponder_cost.iter().zip(outcome.num_units.iter()) {
            assert!(units >= 1 && units as usize <= UNITS);
            assert!(cost >= units as f32 && cost <= units as f32 + 1.0);
        }
    }
}

#[test]
fn act_output_is_the_weighted_mixture_of_unit_outputs() {
    let input = Tensor::zeros([3, 2, 2, 1]).unwrap();
    let block = block(&random_maps(5, (3, 1, 1)), 0.0);
    let outcome = run(&block, &input, HaltingVariant::Act, 0.01);
    for image in 0..3 {
        let expected: f32 = (0..UNITS)
            .map(|t| outcome.halting_distribution[[image, 0, 0, t]] * (t + 1) as f32)
            .sum();
        for &value in outcome.output.array().index_axis(Axis(0), image).iter() {
            assert!((value - expected).abs() < 1e-5);
        }
    }
    assert!(outcome.residual_mask.is_none());
}

#[test]
fn larger_epsilon_never_increases_ponder_cost() {
    let input = Tensor::zeros([6, 2, 2, 1]).unwrap();
    for (variant, dim) in [
        (HaltingVariant::Act, (6, 1, 1)),
        (HaltingVariant::Sact, (6, 2, 2)),
    ] {
        let block = block(&random_maps(23, dim), 0.0);
        let mut previous: Option<HaltingOutcome> = None;
        for epsilon in [0.001, 0.01, 0.1, 0.3, 0.6] {
            let outcome = run(&block, &input, variant, epsilon);
            if let Some(previous) = &previous {
                for (now, before) in outcome.ponder_cost.iter().zip(previous.ponder_cost.iter()) {
                    assert!(*now <= *before + 1e-6, "{variant:?} at ε={epsilon}");
                }
                for (now, before) in outcome.num_units.iter().zip(previous.num_units.iter()) {
                    assert!(now <= before);
                }
            }
            previous = Some(outcome);
        }
    }
}

#[test]
fn early_stopping_matches_act_and_skips_idle_units() {
    let input = Tensor::zeros([2, 2, 2, 1]).unwrap();
    let maps: Vec<Array3<f32>> = [0.7, 0.5, 0.1, 0.1]
        .into_iter()
        .map(|p| Array3::from_elem((2, 1, 1), p))
        .collect();
    let block = block(&maps, 3.0);

    let act = run(&block, &input, HaltingVariant::Act, 0.01);
    let early = run(&block, &input, HaltingVariant::ActEarlyStopping, 0.01);
    assert_eq!(act.output, early.output);
    assert_eq!(act.ponder_cost, early.ponder_cost);
    assert_eq!(act.num_units, early.num_units);
    assert_eq!(act.halting_distribution, early.halting_distribution);
    assert_eq!(act.flops, early.flops);
    assert!(act.num_units.iter().all(|&units| units == 2));
    // Two units over four positions, each followed by its estimator.
    let expected = 2.0 * (4.0 * ShiftUnit::FLOPS_PER_POSITION + 3.0);
    assert!(act.flops.iter().all(|&flops| flops == expected));
}

#[test]
fn sact_masks_leave_halted_positions_untouched() {
    let input = Tensor::zeros([1, 1, 2, 1]).unwrap();
    // Position 0 halts after the first unit, position 1 runs to the end.
    let maps: Vec<Array3<f32>> = (0..UNITS - 1)
        .map(|_| Array3::from_shape_vec((1, 1, 2), vec![1.0, 0.0]).unwrap())
        .collect();
    let block = block(&maps, 0.0);
    let outcome = run(&block, &input, HaltingVariant::Sact, 0.01);

    assert_eq!(outcome.num_units.iter().copied().collect::<Vec<_>>(), vec![1, UNITS as u32]);
    assert_eq!(outcome.ponder_cost[[0, 0, 0]], 2.0);
    assert_eq!(outcome.ponder_cost[[0, 0, 1]], UNITS as f32 + 1.0);
    // Position 0 keeps the first unit's output; position 1 keeps accumulating
    // and takes the last unit's output with full weight.
    assert_eq!(outcome.output.array()[[0, 0, 0, 0]], 1.0);
    assert_eq!(outcome.output.array()[[0, 0, 1, 0]], UNITS as f32);
    let per_position = ShiftUnit::FLOPS_PER_POSITION;
    assert_eq!(outcome.flops[0], 2.0 * per_position + (UNITS - 1) as f64 * per_position);
    let mask = outcome.residual_mask.unwrap();
    assert!(mask.iter().all(|&m| m == 0.0));
}
