// Measures the two kernels every FISTA iteration pays for: the weighted least-squares
// estimate and the correlation loss with its adjoint gradient, across feature counts.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dtd::estimate::estimate;
use dtd::loss::DeconvolutionLoss;
use dtd::mix::{MixingConfig, MixtureSet, mix_samples};
use dtd::sample::sample_reference;
use dtd::synthetic::SyntheticDataBuilder;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;

const FEATURE_COUNTS: [usize; 3] = [100, 500, 2000];
const CATEGORIES: usize = 6;
const MIXTURES: usize = 200;

fn training_problem(n_features: usize) -> (Array2<f64>, MixtureSet) {
    let data = SyntheticDataBuilder::new(11)
        .features(n_features)
        .categories(CATEGORIES)
        .samples_per_category(40)
        .build()
        .expect("synthetic data");
    let matrix = data.matrix.normalize_to_count(None).expect("normalize");
    let assignments = data.labels.assign(&matrix, &data.categories);
    let mut rng = StdRng::seed_from_u64(3);
    let reference = sample_reference(&matrix, &assignments, &data.categories, 0.25, None, &mut rng)
        .expect("reference");
    let pool = reference.remaining_columns(&assignments);
    let config = MixingConfig {
        n_samples: MIXTURES,
        n_per_mixture: 20,
    };
    let mixtures = mix_samples(&matrix, &assignments, &data.categories, &pool, &config, None, &mut rng)
        .expect("mixtures");
    (reference.reference, mixtures)
}

fn benchmark_gradient(c: &mut Criterion) {
    let mut group = c.benchmark_group("deconvolution");
    for &n_features in &FEATURE_COUNTS {
        let (reference, set) = training_problem(n_features);
        let g = Array1::from_shape_fn(n_features, |i| 0.5 + (i % 7) as f64 / 7.0);
        let loss = DeconvolutionLoss::new(reference.view(), set.mixtures(), set.quantities())
            .expect("loss");
        group.throughput(Throughput::Elements(n_features as u64));

        group.bench_with_input(BenchmarkId::new("estimate", n_features), &g, |b, g| {
            b.iter(|| {
                let c_hat = estimate(black_box(reference.view()), g, set.mixtures(), false);
                black_box(c_hat)
            })
        });
        group.bench_with_input(BenchmarkId::new("loss_and_gradient", n_features), &g, |b, g| {
            b.iter(|| black_box(loss.smooth_loss_and_gradient(black_box(g.view()))))
        });
        group.bench_with_input(
            BenchmarkId::new("nonnegative_loss_and_gradient", n_features),
            &g,
            |b, g| {
                let constrained = loss.with_nonnegative(true);
                b.iter(|| black_box(constrained.smooth_loss_and_gradient(black_box(g.view()))))
            },
        );
    }
    group.finish();
}

criterion_group!(gradient, benchmark_gradient);
criterion_main!(gradient);
