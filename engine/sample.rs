//! # Reference Sampling
//!
//! Builds the reference matrix `X` (features × categories) by drawing a stratified random
//! subset of each category's samples and averaging them. The drawn samples are reported
//! back so that no sample used for the reference can later leak into a mixture.

use crate::labels::{Category, CategorySet, members_by_category};
use crate::matrix::{self, ExpressionMatrix, MatrixError};
use ndarray::Array2;
use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Sampling percentage must lie in (0, 1], got {0}.")]
    InvalidPercentage(f64),
    #[error("Category '{0}' has no samples to draw a reference profile from.")]
    EmptyCategory(String),
    #[error("Received {found} category assignments for a matrix with {expected} samples.")]
    AssignmentMismatch { expected: usize, found: usize },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// The reference matrix and the bookkeeping of which samples it consumed.
#[derive(Debug, Clone)]
pub struct ReferenceSample {
    /// Features × categories, each column count-normalized.
    pub reference: Array2<f64>,
    /// Consumed column indices into the source matrix, ascending.
    pub consumed_columns: Vec<usize>,
    /// Identifiers of the consumed samples, aligned with `consumed_columns`.
    pub consumed_ids: Vec<String>,
    /// Number of samples drawn per category, in category order.
    pub per_category: Vec<usize>,
}

impl ReferenceSample {
    /// Columns with an allowed category that were not used for the reference.
    pub fn remaining_columns(&self, assignments: &[Category]) -> Vec<usize> {
        let mut consumed = vec![false; assignments.len()];
        for &j in &self.consumed_columns {
            if j < consumed.len() {
                consumed[j] = true;
            }
        }
        assignments
            .iter()
            .enumerate()
            .filter(|(j, category)| !consumed[*j] && category.index().is_some())
            .map(|(j, _)| j)
            .collect()
    }
}

/// ⌈p·n⌉, guarded against floating overshoot such as 0.3·10 = 3.0000000000000004.
pub fn sample_count(percentage: f64, n: usize) -> usize {
    let raw = (percentage * n as f64 - 1e-9).ceil();
    (raw.max(0.0) as usize).min(n)
}

/// Draws ⌈p·n_k⌉ samples per allowed category without replacement and averages them into
/// that category's reference column.
pub fn sample_reference<R: Rng + ?Sized>(
    matrix: &ExpressionMatrix,
    assignments: &[Category],
    categories: &CategorySet,
    percentage: f64,
    total: Option<f64>,
    rng: &mut R,
) -> Result<ReferenceSample, SamplingError> {
    if !(percentage > 0.0 && percentage <= 1.0) {
        return Err(SamplingError::InvalidPercentage(percentage));
    }
    if assignments.len() != matrix.n_samples() {
        return Err(SamplingError::AssignmentMismatch {
            expected: matrix.n_samples(),
            found: assignments.len(),
        });
    }
    let total = matrix::resolve_total(total, matrix.n_features())?;

    let members = members_by_category(assignments, categories.len());
    let mut reference = Array2::zeros((matrix.n_features(), categories.len()));
    let mut consumed_columns = Vec::new();
    let mut per_category = Vec::with_capacity(categories.len());

    for (k, pool) in members.iter().enumerate() {
        let name = categories.name(k).unwrap_or_default();
        if pool.is_empty() {
            return Err(SamplingError::EmptyCategory(name.to_string()));
        }
        let take = sample_count(percentage, pool.len());
        let chosen: Vec<usize> = pool.choose_multiple(&mut *rng, take).copied().collect();
        log::debug!(
            "Reference column '{}': averaging {} of {} samples",
            name,
            chosen.len(),
            pool.len()
        );

        let mut profile = matrix::column_mean(matrix.values(), &chosen);
        matrix::normalize_column(profile.view_mut(), total);
        reference.column_mut(k).assign(&profile);

        per_category.push(chosen.len());
        consumed_columns.extend(chosen);
    }

    consumed_columns.sort_unstable();
    let consumed_ids = consumed_columns
        .iter()
        .map(|&j| matrix.sample_ids()[j].clone())
        .collect();

    log::info!(
        "Built reference matrix from {} samples across {} categories",
        consumed_columns.len(),
        categories.len()
    );

    Ok(ReferenceSample {
        reference,
        consumed_columns,
        consumed_ids,
        per_category,
    })
}
