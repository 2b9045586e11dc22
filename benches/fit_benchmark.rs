use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use logigam::basis::{bspline_basis, generate_knots};
use logigam::{ColumnStorage, FeatureKind, GamConfig, LogisticGam, PerFeature, SolverKind};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of simulated observations.
const NUM_SAMPLES: usize = 5_000;
const NUM_FEATURES: usize = 3;

fn simulate(n: usize) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(42);
    let x: Array2<f64> = Array2::from_shape_fn((n, NUM_FEATURES), |_| rng.gen_range(-2.0..2.0));
    let y = x.rows().into_iter().map(|row| {
        let eta = 2.0 * row[0] - row[1] * row[1] + (3.0 * row[2]).sin();
        let p = 1.0 / (1.0 + f64::exp(-eta));
        if rng.gen_bool(p) { 1.0 } else { 0.0 }
    });
    let y = Array1::from_iter(y);
    (x, y)
}

fn basis_construction(c: &mut Criterion) {
    let (x, _) = simulate(NUM_SAMPLES);
    let column = x.column(0);
    let mut group = c.benchmark_group("bspline_basis");
    for n_knots in [10, 20, 40] {
        let knots = generate_knots(column, FeatureKind::Continuous, n_knots, true)
            .expect("knot generation");
        group.bench_with_input(BenchmarkId::from_parameter(n_knots), &knots, |b, knots| {
            b.iter(|| bspline_basis(black_box(column), knots.view(), 4, true).expect("basis"))
        });
    }
    group.finish();
}

fn full_fit(c: &mut Criterion) {
    let (x, y) = simulate(NUM_SAMPLES);
    let storage = [ColumnStorage::Real; NUM_FEATURES];
    let mut group = c.benchmark_group("fit");
    group.sample_size(10);
    for (name, solver) in [("stable", SolverKind::Stable), ("direct", SolverKind::Direct)] {
        let config = GamConfig::default()
            .with_n_knots(PerFeature::Broadcast(10))
            .with_solver(solver)
            .with_seed(1);
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut gam = LogisticGam::new(config.clone());
                gam.fit(black_box(x.view()), &storage, y.view()).expect("fit")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, basis_construction, full_fit);
criterion_main!(benches);
