//! # Synthetic Mixtures
//!
//! Combines randomly drawn labeled profiles into in-silico bulk samples whose true
//! composition is known. The quantities matrix records, per mixture, the fraction of
//! contributing profiles from each allowed category.

use crate::labels::{Category, CategorySet};
use crate::matrix::{self, ExpressionMatrix, MatrixError};
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MixingError {
    #[error("Cannot draw {requested} profiles per mixture from a pool of {available} labeled samples.")]
    PoolTooSmall { requested: usize, available: usize },
    #[error("The number of mixtures must be positive.")]
    NoMixtures,
    #[error("Each mixture needs at least one source profile.")]
    EmptyMixture,
    #[error("Test fraction must lie in (0, 1), got {0}.")]
    InvalidTestFraction(f64),
    #[error("Pool column {column} is out of range for a matrix with {n_samples} samples.")]
    ColumnOutOfRange { column: usize, n_samples: usize },
    #[error("Received {found} category assignments for a matrix with {expected} samples.")]
    AssignmentMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Hyperparameters for one batch of synthetic mixtures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixingConfig {
    /// Number of synthetic mixtures to produce.
    pub n_samples: usize,
    /// Number of distinct source profiles summed into each mixture.
    pub n_per_mixture: usize,
}

/// Synthetic mixtures with their ground-truth compositions.
#[derive(Debug, Clone)]
pub struct MixtureSet {
    /// Features × mixtures, count-normalized.
    pub mixtures: Array2<f64>,
    /// Categories × mixtures; every column lies in [0, 1] and sums to 1.
    pub quantities: Array2<f64>,
    /// Source column indices behind each mixture.
    pub sources: Vec<Vec<usize>>,
}

impl MixtureSet {
    pub fn n_mixtures(&self) -> usize {
        self.mixtures.ncols()
    }

    pub fn mixtures(&self) -> ArrayView2<'_, f64> {
        self.mixtures.view()
    }

    pub fn quantities(&self) -> ArrayView2<'_, f64> {
        self.quantities.view()
    }

    /// The subset of mixtures at the given positions.
    pub fn select(&self, columns: &[usize]) -> MixtureSet {
        MixtureSet {
            mixtures: self.mixtures.select(Axis(1), columns),
            quantities: self.quantities.select(Axis(1), columns),
            sources: columns.iter().map(|&j| self.sources[j].clone()).collect(),
        }
    }
}

/// Shuffles `pool` and splits it into disjoint (training, test) pools, with
/// `⌊test_fraction · n⌋` columns assigned to the test pool.
pub fn split_pool<R: Rng + ?Sized>(
    pool: &[usize],
    test_fraction: f64,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<usize>), MixingError> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(MixingError::InvalidTestFraction(test_fraction));
    }
    let mut shuffled = pool.to_vec();
    shuffled.shuffle(&mut *rng);
    let n_test = (test_fraction * shuffled.len() as f64).floor() as usize;
    let test = shuffled.split_off(shuffled.len() - n_test);
    Ok((shuffled, test))
}

/// Builds `config.n_samples` mixtures, each the count-normalized sum of
/// `config.n_per_mixture` distinct profiles drawn uniformly from `pool`.
pub fn mix_samples<R: Rng + ?Sized>(
    matrix: &ExpressionMatrix,
    assignments: &[Category],
    categories: &CategorySet,
    pool: &[usize],
    config: &MixingConfig,
    total: Option<f64>,
    rng: &mut R,
) -> Result<MixtureSet, MixingError> {
    if config.n_samples == 0 {
        return Err(MixingError::NoMixtures);
    }
    if config.n_per_mixture == 0 {
        return Err(MixingError::EmptyMixture);
    }
    if assignments.len() != matrix.n_samples() {
        return Err(MixingError::AssignmentMismatch {
            expected: matrix.n_samples(),
            found: assignments.len(),
        });
    }
    let total = matrix::resolve_total(total, matrix.n_features())?;

    let mut eligible = Vec::with_capacity(pool.len());
    for &j in pool {
        if j >= matrix.n_samples() {
            return Err(MixingError::ColumnOutOfRange {
                column: j,
                n_samples: matrix.n_samples(),
            });
        }
        if let Category::Known(k) = assignments[j] {
            eligible.push((j, k));
        }
    }
    if eligible.len() < pool.len() {
        log::debug!(
            "Dropped {} unassigned samples from the mixing pool",
            pool.len() - eligible.len()
        );
    }
    if eligible.len() < config.n_per_mixture {
        return Err(MixingError::PoolTooSmall {
            requested: config.n_per_mixture,
            available: eligible.len(),
        });
    }

    let values = matrix.values();
    let mut mixtures = Array2::zeros((matrix.n_features(), config.n_samples));
    let mut quantities = Array2::zeros((categories.len(), config.n_samples));
    let mut sources = Vec::with_capacity(config.n_samples);
    let share = 1.0 / config.n_per_mixture as f64;

    for m in 0..config.n_samples {
        let drawn: Vec<(usize, usize)> = eligible
            .choose_multiple(&mut *rng, config.n_per_mixture)
            .copied()
            .collect();
        let mut mixture = mixtures.column_mut(m);
        for &(j, k) in &drawn {
            mixture += &values.column(j);
            quantities[[k, m]] += share;
        }
        matrix::normalize_column(mixture, total);
        sources.push(drawn.into_iter().map(|(j, _)| j).collect());
    }

    log::info!(
        "Mixed {} synthetic samples from {} profiles each (pool of {})",
        config.n_samples,
        config.n_per_mixture,
        eligible.len()
    );

    Ok(MixtureSet {
        mixtures,
        quantities,
        sources,
    })
}
