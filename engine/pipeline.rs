//! # Training Pipeline
//!
//! Runs the whole data flow on one labeled expression matrix:
//!
//! 1. Count-normalize the matrix and resolve labels against the category allow-list.
//! 2. Average a stratified sample of each category into the reference matrix.
//! 3. Split the untouched samples into disjoint training and test pools and mix each.
//! 4. Select λ by cross-validation on the training mixtures and refit.
//! 5. Deconvolve the test mixtures with the learned weights and with the untrained
//!    all-ones vector, and compare their correlations.

use crate::config::{ConfigError, PipelineConfig};
use crate::crossval::{CrossValidationError, CrossValidationReport, cross_validate};
use crate::estimate::{EstimationError, Estimator, WeightSource};
use crate::labels::{CategorySet, LabelMap};
use crate::loss::{CorrelationAxis, LossConfig, correlations, pearson, spearman};
use crate::matrix::{ExpressionMatrix, MatrixError};
use crate::mix::{MixingError, MixtureSet, mix_samples, split_pool};
use crate::model::{Model, ModelError};
use crate::progress::CrossValidationProgress;
use crate::sample::{ReferenceSample, SamplingError, sample_reference};
use crate::types::FeatureWeights;
use ndarray::{Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Mixing(#[from] MixingError),
    #[error(transparent)]
    CrossValidation(#[from] CrossValidationError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// How well one weighting vector recovers the compositions of a mixture set.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Pearson correlation per mixture, across categories.
    pub per_mixture: Array1<f64>,
    /// Pearson correlation per category, across mixtures.
    pub per_category: Array1<f64>,
    pub mean_pearson: f64,
    pub mean_spearman: f64,
}

impl Evaluation {
    fn from_estimates(truth: ArrayView2<f64>, estimates: ArrayView2<f64>) -> Self {
        let per_mixture = correlations(truth, estimates, CorrelationAxis::Samples, pearson);
        let per_category = correlations(truth, estimates, CorrelationAxis::Categories, pearson);
        let mean_spearman = correlations(truth, estimates, CorrelationAxis::Samples, spearman)
            .mean()
            .unwrap_or(0.0);
        Self {
            mean_pearson: per_mixture.mean().unwrap_or(0.0),
            per_mixture,
            per_category,
            mean_spearman,
        }
    }
}

/// Deconvolves `mixtures` with `weights` and scores the estimates against the truth.
/// An all-zero weighting vector estimates nothing and scores zero everywhere.
pub fn evaluate<W: WeightSource + ?Sized>(
    reference: ArrayView2<f64>,
    weights: &W,
    mixtures: &MixtureSet,
    loss: &LossConfig,
) -> Result<Evaluation, EstimationError> {
    let g = weights.feature_weights();
    if g.iter().all(|&v| v == 0.0) && loss.ridge <= 0.0 {
        log::warn!("Evaluating an all-zero weighting vector; every correlation is 0");
        let estimates = Array2::zeros(mixtures.quantities.raw_dim());
        return Ok(Evaluation::from_estimates(mixtures.quantities(), estimates.view()));
    }
    let estimates = Estimator::with_ridge(reference, g, loss.ridge)?.solve(mixtures.mixtures(), loss.nonnegative)?;
    Ok(Evaluation::from_estimates(mixtures.quantities(), estimates.view()))
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub model: Model,
    pub report: CrossValidationReport,
    /// The reference matrix and the samples it consumed.
    pub reference: ReferenceSample,
    pub training: MixtureSet,
    pub test: MixtureSet,
    /// Test-set scores of the learned weights.
    pub trained: Evaluation,
    /// Test-set scores of the all-ones vector.
    pub baseline: Evaluation,
}

impl PipelineOutcome {
    /// Mean test Pearson correlation gained over the untrained baseline.
    pub fn improvement(&self) -> f64 {
        self.trained.mean_pearson - self.baseline.mean_pearson
    }
}

pub fn run(
    matrix: &ExpressionMatrix,
    labels: &LabelMap,
    categories: &CategorySet,
    config: &PipelineConfig,
    progress: &dyn CrossValidationProgress,
) -> Result<PipelineOutcome, PipelineError> {
    config.validate()?;
    let total = config.normalization_total;
    let normalized = matrix.normalize_to_count(total)?;
    let assignments = labels.assign(&normalized, categories);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let reference = sample_reference(
        &normalized,
        &assignments,
        categories,
        config.reference_fraction,
        total,
        &mut rng,
    )?;
    let remaining = reference.remaining_columns(&assignments);
    let (train_pool, test_pool) = split_pool(&remaining, config.test_fraction, &mut rng)?;
    log::info!(
        "Reference consumed {} samples; {} remain for training and {} for testing",
        reference.consumed_columns.len(),
        train_pool.len(),
        test_pool.len()
    );

    let training = mix_samples(
        &normalized,
        &assignments,
        categories,
        &train_pool,
        &config.training,
        total,
        &mut rng,
    )?;
    let test = mix_samples(
        &normalized,
        &assignments,
        categories,
        &test_pool,
        &config.test,
        total,
        &mut rng,
    )?;

    let cv = &config.cross_validation;
    let report = cross_validate(reference.reference.view(), &training, cv, None, progress)?;
    let model = Model::from_fit(
        report.fit.clone(),
        report.selected_lambda,
        normalized.feature_ids().to_vec(),
        categories.names().to_vec(),
        cv.loss,
    )?;

    let trained = evaluate(reference.reference.view(), &model, &test, &cv.loss)?;
    let baseline = evaluate(
        reference.reference.view(),
        &FeatureWeights::ones(normalized.n_features()),
        &test,
        &cv.loss,
    )?;
    log::info!(
        "Test correlation {:.4} with {} of {} features (baseline {:.4})",
        trained.mean_pearson,
        model.nonzero_count(),
        normalized.n_features(),
        baseline.mean_pearson
    );

    Ok(PipelineOutcome {
        model,
        report,
        reference,
        training,
        test,
        trained,
        baseline,
    })
}
