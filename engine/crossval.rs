//! # Cross-Validated λ Selection
//!
//! Splits the training mixtures into k folds, trains on k − 1 folds across the λ grid and
//! scores the smooth loss on the held-out fold. The λ with the lowest mean held-out loss
//! wins (ties go to the larger, sparser λ). The final model retraces the same ascending
//! path on the full training set up to the selected λ, so it is trained the way its score
//! was earned. Folds are independent and run on the rayon pool.

use crate::estimate::EstimationError;
use crate::loss::{DeconvolutionLoss, LossConfig};
use crate::mix::MixtureSet;
use crate::optimize::{self, ConvergenceStatus, FistaConfig, FistaResult, OptimizationError};
use crate::progress::{CrossValidationProgress, TrainingStage};
use itertools::Itertools;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean held-out losses closer than this count as tied.
pub const TIE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum CrossValidationError {
    #[error("The λ grid is empty.")]
    EmptyLambdaGrid,
    #[error("Every λ in an explicit grid must be finite and positive, got {0}.")]
    NonPositiveLambda(f64),
    #[error("An automatic λ grid needs count ≥ 1 and a floor ratio in (0, 1), got count {count} and ratio {floor_ratio}.")]
    InvalidAutoGrid { count: usize, floor_ratio: f64 },
    #[error("The automatic λ bound must be finite and positive, got {0}.")]
    DegenerateLambdaBound(f64),
    #[error("Fold count must lie in [2, {mixtures}] for {mixtures} training mixtures, got {folds}.")]
    InvalidFoldCount { folds: usize, mixtures: usize },
    #[error("Training at λ = {lambda:.4e} on {} failed: {source}", match .fold {
        Some(f) => format!("fold {f}"),
        None => "the full training set".to_string(),
    })]
    Fit {
        lambda: f64,
        fold: Option<usize>,
        #[source]
        source: OptimizationError,
    },
    #[error("Scoring λ = {lambda:.4e} on held-out fold {fold} failed: {source}")]
    HeldOut {
        lambda: f64,
        fold: usize,
        #[source]
        source: EstimationError,
    },
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Optimization(#[from] OptimizationError),
}

/// Candidate regularization strengths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LambdaGrid {
    /// Fixed values. The smooth loss is a mean over mixtures, so λ is on the scale of one
    /// mixture's correlation: the same value means the same trade-off on a fold and on the
    /// full training set, and values at or above `1/√p` zero every renormalized fit.
    Explicit { values: Vec<f64> },
    /// `count` values log-spaced from the zeroing bound down to `bound · floor_ratio`.
    Auto { count: usize, floor_ratio: f64 },
}

impl Default for LambdaGrid {
    fn default() -> Self {
        Self::Auto {
            count: 10,
            floor_ratio: 1e-4,
        }
    }
}

impl LambdaGrid {
    pub fn validate(&self) -> Result<(), CrossValidationError> {
        match self {
            Self::Explicit { values } => {
                if values.is_empty() {
                    return Err(CrossValidationError::EmptyLambdaGrid);
                }
                if let Some(&bad) = values.iter().find(|v| !(v.is_finite() && **v > 0.0)) {
                    return Err(CrossValidationError::NonPositiveLambda(bad));
                }
                Ok(())
            }
            &Self::Auto { count, floor_ratio } => {
                if count == 0 || !(floor_ratio > 0.0 && floor_ratio < 1.0) {
                    return Err(CrossValidationError::InvalidAutoGrid { count, floor_ratio });
                }
                Ok(())
            }
        }
    }

    /// The grid in ascending order. `bound` is only consulted for automatic grids.
    pub fn resolve(&self, bound: impl FnOnce() -> Result<f64, CrossValidationError>) -> Result<Vec<f64>, CrossValidationError> {
        self.validate()?;
        let values = match self {
            Self::Explicit { values } => values.clone(),
            &Self::Auto { count, floor_ratio } => {
                let lambda_max = bound()?;
                if !(lambda_max.is_finite() && lambda_max > 0.0) {
                    return Err(CrossValidationError::DegenerateLambdaBound(lambda_max));
                }
                log_spaced(lambda_max, floor_ratio, count)
            }
        };
        Ok(values
            .into_iter()
            .sorted_by(f64::total_cmp)
            .dedup()
            .collect())
    }
}

/// `count` values from `upper` down to `upper · floor_ratio`, equally spaced in log scale.
pub fn log_spaced(upper: f64, floor_ratio: f64, count: usize) -> Vec<f64> {
    if count <= 1 {
        return vec![upper];
    }
    (0..count)
        .map(|i| upper * floor_ratio.powf(i as f64 / (count - 1) as f64))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossValidationConfig {
    pub folds: usize,
    pub lambdas: LambdaGrid,
    pub warm_start: bool,
    /// Seed for the fold shuffle.
    pub seed: u64,
    pub loss: LossConfig,
    pub fista: FistaConfig,
}

impl Default for CrossValidationConfig {
    fn default() -> Self {
        Self {
            folds: 5,
            lambdas: LambdaGrid::default(),
            warm_start: true,
            seed: 42,
            loss: LossConfig::default(),
            fista: FistaConfig::default(),
        }
    }
}

/// One (λ, fold) cell of the cross-validation grid.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldLoss {
    pub lambda: f64,
    pub fold: usize,
    pub held_out_loss: f64,
    pub nonzero: usize,
    pub iterations: usize,
    pub status: ConvergenceStatus,
}

#[derive(Debug, Clone)]
pub struct CrossValidationReport {
    /// The λ grid, ascending.
    pub lambdas: Vec<f64>,
    /// Every (λ, fold) result, grouped by fold then λ.
    pub grid: Vec<FoldLoss>,
    /// Mean held-out loss per λ, aligned with `lambdas`.
    pub mean_loss: Vec<f64>,
    pub selected_lambda: f64,
    /// The refit on the full training set at the selected λ.
    pub fit: FistaResult,
}

impl CrossValidationReport {
    pub fn fold_losses(&self, lambda: f64) -> impl Iterator<Item = &FoldLoss> {
        self.grid.iter().filter(move |cell| cell.lambda == lambda)
    }
}

/// Shuffles `0..n` with `seed` and deals the positions round-robin into `folds` groups.
pub fn assign_folds(n: usize, folds: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    let mut groups = vec![Vec::new(); folds];
    for (i, j) in order.into_iter().enumerate() {
        groups[i % folds].push(j);
    }
    for group in &mut groups {
        group.sort_unstable();
    }
    groups
}

/// Index of the λ with the lowest mean loss; near ties resolve to the larger λ.
pub fn select_lambda(lambdas: &[f64], mean_loss: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &loss) in mean_loss.iter().enumerate() {
        best = match best {
            None => Some((i, loss)),
            Some((j, best_loss)) => {
                if loss < best_loss - TIE_TOLERANCE {
                    Some((i, loss))
                } else if loss <= best_loss + TIE_TOLERANCE && lambdas[i] > lambdas[j] {
                    Some((i, loss.min(best_loss)))
                } else {
                    Some((j, best_loss))
                }
            }
        };
    }
    best.map(|(i, _)| i)
}

fn train_fold(
    reference: ArrayView2<f64>,
    training: &MixtureSet,
    fold: usize,
    held_out: &[usize],
    lambdas: &[f64],
    start: ArrayView1<f64>,
    config: &CrossValidationConfig,
    progress: &dyn CrossValidationProgress,
) -> Result<Vec<FoldLoss>, CrossValidationError> {
    let train_columns = (0..training.n_mixtures())
        .filter(|j| held_out.binary_search(j).is_err())
        .collect_vec();
    let train = training.select(&train_columns);
    let test = training.select(held_out);
    let train_loss = config
        .loss
        .build(reference, train.mixtures(), train.quantities())?;
    let test_loss = config
        .loss
        .build(reference, test.mixtures(), test.quantities())?;

    let mut cells = Vec::with_capacity(lambdas.len());
    let mut previous: Option<(f64, FistaResult)> = None;
    for &lambda in lambdas {
        let result = optimize::path_point(
            &train_loss,
            lambda,
            previous.as_ref().map(|(l, fit)| (*l, fit)),
            start,
            &config.fista,
            config.warm_start,
        )
        .map_err(|source| CrossValidationError::Fit {
            lambda,
            fold: Some(fold),
            source,
        })?;
        let held_out_loss = test_loss
            .smooth_loss(result.weights.as_view())
            .map_err(|source| CrossValidationError::HeldOut {
                lambda,
                fold,
                source,
            })?;
        progress.on_fit_complete(fold, lambda, held_out_loss);
        cells.push(FoldLoss {
            lambda,
            fold,
            held_out_loss,
            nonzero: result.weights.nonzero_count(),
            iterations: result.iterations,
            status: result.status,
        });
        previous = Some((lambda, result));
    }
    Ok(cells)
}

/// Refits on the full training set along the fold path up to `lambdas[best]`.
fn refit(
    full_loss: &DeconvolutionLoss<'_>,
    lambdas: &[f64],
    best: usize,
    start: ArrayView1<f64>,
    config: &CrossValidationConfig,
) -> Result<FistaResult, CrossValidationError> {
    let path = if config.warm_start {
        &lambdas[..=best]
    } else {
        &lambdas[best..=best]
    };
    let mut previous: Option<(f64, FistaResult)> = None;
    for &lambda in path {
        let result = optimize::path_point(
            full_loss,
            lambda,
            previous.as_ref().map(|(l, fit)| (*l, fit)),
            start,
            &config.fista,
            config.warm_start,
        )
        .map_err(|source| CrossValidationError::Fit {
            lambda,
            fold: None,
            source,
        })?;
        previous = Some((lambda, result));
    }
    previous
        .map(|(_, fit)| fit)
        .ok_or(CrossValidationError::EmptyLambdaGrid)
}

/// Selects λ by k-fold cross-validation on `training` and refits on all of it.
/// `start` defaults to the all-ones vector.
pub fn cross_validate(
    reference: ArrayView2<f64>,
    training: &MixtureSet,
    config: &CrossValidationConfig,
    start: Option<ArrayView1<f64>>,
    progress: &dyn CrossValidationProgress,
) -> Result<CrossValidationReport, CrossValidationError> {
    let n = training.n_mixtures();
    if config.folds < 2 || config.folds > n {
        return Err(CrossValidationError::InvalidFoldCount {
            folds: config.folds,
            mixtures: n,
        });
    }
    let start: Array1<f64> = match start {
        Some(start) => start.to_owned(),
        None => Array1::ones(reference.nrows()),
    };

    let full_loss = config
        .loss
        .build(reference, training.mixtures(), training.quantities())?;
    let lambdas = config.lambdas.resolve(|| {
        Ok(optimize::lambda_max(&full_loss, start.view(), &config.fista)?)
    })?;
    log::info!(
        "Cross-validating {} λ values from {:.4e} to {:.4e} over {} folds",
        lambdas.len(),
        lambdas[0],
        lambdas[lambdas.len() - 1],
        config.folds
    );

    let folds = assign_folds(n, config.folds, config.seed);
    progress.on_stage_start(TrainingStage::CrossValidation, folds.len() * lambdas.len());
    let per_fold: Vec<Vec<FoldLoss>> = folds
        .par_iter()
        .enumerate()
        .map(|(fold, held_out)| {
            train_fold(
                reference,
                training,
                fold,
                held_out,
                &lambdas,
                start.view(),
                config,
                progress,
            )
        })
        .collect::<Result<_, _>>()?;
    progress.on_stage_finish(TrainingStage::CrossValidation);

    let grid = per_fold.into_iter().flatten().collect_vec();
    let mean_loss = lambdas
        .iter()
        .map(|&lambda| {
            let losses = grid
                .iter()
                .filter(|cell| cell.lambda == lambda)
                .map(|cell| cell.held_out_loss)
                .collect_vec();
            losses.iter().sum::<f64>() / losses.len() as f64
        })
        .collect_vec();
    for (lambda, loss) in lambdas.iter().zip(&mean_loss) {
        log::debug!("λ = {:.4e}: mean held-out loss {:.6}", lambda, loss);
    }
    let unconverged = grid
        .iter()
        .filter(|cell| cell.status != ConvergenceStatus::Converged)
        .count();
    if unconverged > 0 {
        log::debug!("{} of {} fold fits ended before meeting the tolerance", unconverged, grid.len());
    }

    let best = select_lambda(&lambdas, &mean_loss).ok_or(CrossValidationError::EmptyLambdaGrid)?;
    let selected_lambda = lambdas[best];
    log::info!(
        "Selected λ = {:.4e} (mean held-out loss {:.6}); refitting on {} mixtures",
        selected_lambda,
        mean_loss[best],
        n
    );

    progress.on_stage_start(TrainingStage::FinalFit, 1);
    let fit = refit(&full_loss, &lambdas, best, start.view(), config)?;
    progress.on_stage_finish(TrainingStage::FinalFit);
    match fit.status {
        ConvergenceStatus::Converged => {}
        ConvergenceStatus::MaxIterationsReached => log::warn!(
            "Final fit stopped at the iteration limit ({}) without meeting the tolerance",
            fit.iterations
        ),
        ConvergenceStatus::Stalled => log::warn!(
            "Final fit stalled after {} iterations: no step decreased the objective",
            fit.iterations
        ),
    }

    Ok(CrossValidationReport {
        lambdas,
        grid,
        mean_loss,
        selected_lambda,
        fit,
    })
}
