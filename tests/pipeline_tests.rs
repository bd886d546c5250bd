use approx::assert_abs_diff_eq;
use dtd::config::{ConfigError, PipelineConfig};
use dtd::estimate::estimate;
use dtd::labels::{CategorySet, LabelMap};
use dtd::matrix::ExpressionMatrix;
use dtd::mix::{MixingConfig, mix_samples};
use dtd::model::Model;
use dtd::optimize::ConvergenceStatus;
use dtd::pipeline;
use dtd::progress::{CrossValidationProgress, NoopProgress, TrainingStage};
use dtd::synthetic::SyntheticDataBuilder;
use dtd::types::FeatureWeights;
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::Write;
use std::sync::Mutex;

const SMALL_RUN: &str = r#"
seed = 3
reference_fraction = 0.1
test_fraction = 0.5

[training]
n_samples = 60
n_per_mixture = 10

[test]
n_samples = 40
n_per_mixture = 10

[cross_validation]
folds = 3

[cross_validation.lambdas]
kind = "explicit"
values = [0.0001, 0.001, 0.01]

[cross_validation.fista]
max_iterations = 40
"#;

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<String>>,
}

impl CrossValidationProgress for RecordingProgress {
    fn on_stage_start(&self, stage: TrainingStage, total_fits: usize) {
        self.events.lock().unwrap().push(format!("start {stage} {total_fits}"));
    }

    fn on_stage_finish(&self, stage: TrainingStage) {
        self.events.lock().unwrap().push(format!("finish {stage}"));
    }
}

#[test]
fn learned_weights_beat_the_untrained_baseline() {
    let data = SyntheticDataBuilder::new(8)
        .features(50)
        .samples_per_category(40)
        .unassigned_samples(10)
        .build()
        .unwrap();
    let mut config = PipelineConfig::from_toml_str(SMALL_RUN).unwrap();
    config.cross_validation.fista.max_iterations = 100;
    let progress = RecordingProgress::default();

    let outcome = pipeline::run(&data.matrix, &data.labels, &data.categories, &config, &progress).unwrap();

    assert_eq!(outcome.model.weights.len(), 50);
    assert_eq!(outcome.model.feature_ids[0], "gene0001");
    assert_eq!(outcome.model.categories, data.categories.names());
    assert!(outcome.report.lambdas.contains(&outcome.report.selected_lambda));
    assert_eq!(outcome.report.grid.len(), 9);
    assert!(outcome.report.mean_loss.iter().all(|l| l.is_finite()));

    // Reference columns, training and test mixtures never share a sample.
    let training_sources: Vec<usize> = outcome.training.sources.iter().flatten().copied().collect();
    for mixture in &outcome.test.sources {
        assert!(mixture.iter().all(|j| !training_sources.contains(j)));
        assert!(mixture.iter().all(|j| !outcome.reference.consumed_columns.contains(j)));
    }
    assert!(training_sources.iter().all(|&j| j < 120));

    assert!(outcome.trained.mean_pearson.is_finite());
    assert!(
        outcome.improvement() > 0.02,
        "trained {} vs baseline {}",
        outcome.trained.mean_pearson,
        outcome.baseline.mean_pearson
    );

    let markers: Vec<usize> = data.markers.iter().flatten().copied().collect();
    let mean_weight = |rows: &[usize]| rows.iter().map(|&i| outcome.model.weights[i].abs()).sum::<f64>() / rows.len() as f64;
    let background: Vec<usize> = (0..50).filter(|i| !markers.contains(i)).collect();
    assert!(mean_weight(&markers) > mean_weight(&background));

    let events = progress.events.into_inner().unwrap();
    assert_eq!(
        events,
        vec![
            "start cross-validation 9".to_string(),
            "finish cross-validation".to_string(),
            "start final fit 1".to_string(),
            "finish final fit".to_string(),
        ]
    );
}

#[test]
fn pipeline_is_reproducible_for_a_fixed_seed() {
    let data = SyntheticDataBuilder::new(2).features(20).samples_per_category(30).build().unwrap();
    let config = PipelineConfig::from_toml_str(SMALL_RUN).unwrap();
    let first = pipeline::run(&data.matrix, &data.labels, &data.categories, &config, &NoopProgress).unwrap();
    let second = pipeline::run(&data.matrix, &data.labels, &data.categories, &config, &NoopProgress).unwrap();
    assert_eq!(first.model.weights, second.model.weights);
    assert_eq!(first.report.selected_lambda, second.report.selected_lambda);
}

#[test]
fn identical_profiles_are_recovered_exactly_from_mixtures() {
    let profiles = [[9.0, 1.0, 0.0, 2.0, 3.0], [1.0, 8.0, 2.0, 0.0, 4.0], [0.5, 0.5, 7.0, 6.0, 1.0]];
    let per_category = 8;
    let n = profiles.len() * per_category;
    let values = Array2::from_shape_fn((5, n), |(i, j)| profiles[j / per_category][i]);
    let sample_ids: Vec<String> = (0..n).map(|j| format!("s{j}")).collect();
    let matrix = ExpressionMatrix::new(values, (0..5).map(|i| format!("g{i}")).collect(), sample_ids.clone())
        .unwrap()
        .normalize_to_count(Some(1000.0))
        .unwrap();
    let names = ["liver", "heart", "lung"];
    let labels: LabelMap = sample_ids
        .iter()
        .enumerate()
        .map(|(j, id)| (id.clone(), names[j / per_category].to_string()))
        .collect();
    let categories = CategorySet::new(names).unwrap();
    let assignments = labels.assign(&matrix, &categories);

    let reference = Array2::from_shape_fn((5, 3), |(i, k)| matrix.values()[[i, k * per_category]]);
    let pool: Vec<usize> = (0..n).collect();
    let config = MixingConfig {
        n_samples: 25,
        n_per_mixture: 6,
    };
    let mut rng = StdRng::seed_from_u64(4);
    let set = mix_samples(&matrix, &assignments, &categories, &pool, &config, Some(1000.0), &mut rng).unwrap();

    for column in set.quantities.columns() {
        assert_abs_diff_eq!(column.sum(), 1.0, epsilon = 1e-12);
    }
    let weights = FeatureWeights::ones(5);
    for nonneg in [false, true] {
        let estimated = estimate(reference.view(), &weights, set.mixtures(), nonneg).unwrap();
        for (a, b) in estimated.iter().zip(set.quantities.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-8);
        }
    }
}

#[test]
fn model_applies_to_a_reordered_matrix() {
    let model = Model {
        weights: FeatureWeights::new(Array1::from(vec![1.0, 0.0, 2.0])),
        lambda: 0.01,
        feature_ids: vec!["a".into(), "b".into(), "c".into()],
        categories: vec!["x".into(), "y".into()],
        status: ConvergenceStatus::Converged,
        iterations: 3,
        loss_trace: vec![-0.5, -0.7, -0.8],
        weights_trace: None,
        loss: Default::default(),
    };
    let matrix = ExpressionMatrix::new(
        ndarray::array![[3.0, 30.0], [1.0, 10.0], [2.0, 20.0]],
        vec!["c".into(), "a".into(), "b".into()],
        vec!["s1".into(), "s2".into()],
    )
    .unwrap();
    let aligned = model.align_features(&matrix).unwrap();
    assert_eq!(aligned, ndarray::array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]]);
    assert_eq!(model.selected_features(), vec!["a", "c"]);
}

#[test]
fn configuration_loads_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SMALL_RUN.as_bytes()).unwrap();
    let config = PipelineConfig::load(file.path()).unwrap();
    assert_eq!(config.seed, 3);
    assert_eq!(config.cross_validation.fista.max_iterations, 40);
    assert_eq!(config.cross_validation.warm_start, PipelineConfig::default().cross_validation.warm_start);

    let dir = tempfile::tempdir().unwrap();
    let missing = PipelineConfig::load(dir.path().join("absent.toml"));
    assert!(matches!(missing, Err(ConfigError::Io { .. })));
}
