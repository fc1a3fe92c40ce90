use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use ndarray::Array3;
use st_act::testing::{ConstantEstimator, ShiftUnit};
use st_act::{
    AdaptiveComputation, Block, HaltingEstimator, HaltingState, HaltingVariant, ResidualUnit,
};
use st_tensor::Tensor;

#[track_caller]
fn unwrap_ok<T, E: core::fmt::Debug>(context: &str, result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => panic!("{context}: {error:?}"),
    }
}

fn block(units: usize, spatial: bool) -> Block {
    let block = unwrap_ok(
        "block construction failed",
        Block::new("block3", &vec![(); units], |_, _| {
            Ok(Box::new(ShiftUnit::new(64, 0.1)) as Box<dyn ResidualUnit>)
        }),
    );
    unwrap_ok(
        "estimator construction failed",
        block.attach_estimators(|_, _| {
            let estimator = if spatial {
                ConstantEstimator::spatial(0.05)
            } else {
                ConstantEstimator::new(0.05)
            };
            Ok(Some(Box::new(estimator) as Box<dyn HaltingEstimator>))
        }),
    )
}

fn bench_halting_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("halting_state");
    let probability = Array3::<f32>::from_elem((32, 14, 14), 0.3);

    group.bench_function("advance_32x14x14", |b| {
        b.iter_batched(
            || HaltingState::new(32, 14, 14),
            |mut state| {
                for _ in 0..4 {
                    black_box(unwrap_ok(
                        "advance failed",
                        state.advance(Some(probability.view()), 0.01),
                    ));
                }
                black_box(state.ponder_cost())
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_controller(c: &mut Criterion) {
    let mut group = c.benchmark_group("halting_controller");
    let controller = AdaptiveComputation::default();
    let input = unwrap_ok(
        "input initialiser failed",
        Tensor::random_uniform([8, 14, 14, 64], 0.0, 1.0, Some(3)),
    );

    for (name, variant, spatial) in [
        ("act_23_units", HaltingVariant::Act, false),
        ("act_early_stopping_23_units", HaltingVariant::ActEarlyStopping, false),
        ("sact_23_units", HaltingVariant::Sact, true),
    ] {
        let block = block(23, spatial);
        group.bench_function(name, |b| {
            b.iter(|| {
                black_box(unwrap_ok(
                    "halting loop failed",
                    controller.run(&block, &input, variant),
                ))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_halting_state, bench_controller);
criterion_main!(benches);
