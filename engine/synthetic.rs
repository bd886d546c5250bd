//! # Synthetic Expression Data
//!
//! Seeded generator for labeled expression profiles with a known structure: a few marker
//! features per category that are moderately but stably expressed, and abundant background
//! features whose levels barely differ between categories and carry heavy multiplicative
//! noise. Unweighted least squares is dominated by the background; a good weighting vector
//! should favor the markers.

use crate::labels::{CategorySet, LabelError, LabelMap};
use crate::matrix::{ExpressionMatrix, MatrixError};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use thiserror::Error;

/// Label given to samples outside the allow-list.
pub const UNASSIGNED_LABEL: &str = "unclassified";

#[derive(Error, Debug)]
pub enum SyntheticError {
    #[error("Invalid synthetic data dimensions: {0}")]
    InvalidDimensions(String),
    #[error("Log-normal noise scale must be finite and non-negative, got {0}.")]
    InvalidNoise(f64),
    #[error("Expression levels must be finite with 0 < low ≤ high, got [{low}, {high}].")]
    InvalidLevels { low: f64, high: f64 },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
    #[error(transparent)]
    Label(#[from] LabelError),
}

#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub matrix: ExpressionMatrix,
    pub labels: LabelMap,
    pub categories: CategorySet,
    /// Row indices of the marker features, grouped by category.
    pub markers: Vec<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct SyntheticDataBuilder {
    seed: u64,
    n_features: usize,
    n_categories: usize,
    samples_per_category: usize,
    markers_per_category: usize,
    unassigned_samples: usize,
    marker_level: f64,
    marker_noise: f64,
    background_levels: (f64, f64),
    background_noise: f64,
}

impl SyntheticDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            n_features: 50,
            n_categories: 3,
            samples_per_category: 60,
            markers_per_category: 3,
            unassigned_samples: 0,
            marker_level: 8.0,
            marker_noise: 0.05,
            background_levels: (2.0, 20.0),
            background_noise: 1.0,
        }
    }

    pub fn features(mut self, n: usize) -> Self {
        self.n_features = n;
        self
    }

    pub fn categories(mut self, n: usize) -> Self {
        self.n_categories = n;
        self
    }

    pub fn samples_per_category(mut self, n: usize) -> Self {
        self.samples_per_category = n;
        self
    }

    pub fn markers_per_category(mut self, n: usize) -> Self {
        self.markers_per_category = n;
        self
    }

    /// Extra samples whose label is not in the allow-list.
    pub fn unassigned_samples(mut self, n: usize) -> Self {
        self.unassigned_samples = n;
        self
    }

    /// Expression of a marker in its own category; other categories express it at 1.
    pub fn marker_level(mut self, level: f64) -> Self {
        self.marker_level = level;
        self
    }

    /// Range of the shared base level drawn for each background feature.
    pub fn background_levels(mut self, low: f64, high: f64) -> Self {
        self.background_levels = (low, high);
        self
    }

    /// Log-normal σ of the marker and background features.
    pub fn noise(mut self, marker: f64, background: f64) -> Self {
        self.marker_noise = marker;
        self.background_noise = background;
        self
    }

    pub fn build(&self) -> Result<SyntheticData, SyntheticError> {
        let n_markers = self.n_categories * self.markers_per_category;
        if self.n_categories == 0 || self.samples_per_category == 0 {
            return Err(SyntheticError::InvalidDimensions(
                "at least one category with one sample is required".to_string(),
            ));
        }
        if n_markers > self.n_features {
            return Err(SyntheticError::InvalidDimensions(format!(
                "{} marker features do not fit into {} features",
                n_markers, self.n_features
            )));
        }
        let (low, high) = self.background_levels;
        let valid_level = |v: f64| v.is_finite() && v > 0.0;
        if !(valid_level(low) && valid_level(high) && low <= high) {
            return Err(SyntheticError::InvalidLevels { low, high });
        }
        if !valid_level(self.marker_level) {
            return Err(SyntheticError::InvalidLevels {
                low: self.marker_level,
                high: self.marker_level,
            });
        }
        let marker_dist = lognormal(self.marker_noise)?;
        let background_dist = lognormal(self.background_noise)?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let markers: Vec<Vec<usize>> = (0..self.n_categories)
            .map(|k| (k * self.markers_per_category..(k + 1) * self.markers_per_category).collect())
            .collect();
        let base_levels: Vec<f64> = (0..self.n_features)
            .map(|_| rng.gen_range(low..=high))
            .collect();
        let profiles = Array2::from_shape_fn((self.n_features, self.n_categories), |(i, k)| {
            if i < n_markers {
                if i / self.markers_per_category.max(1) == k { self.marker_level } else { 1.0 }
            } else {
                base_levels[i] * rng.gen_range(0.8_f64..1.25)
            }
        });

        let n_labeled = self.n_categories * self.samples_per_category;
        let n_samples = n_labeled + self.unassigned_samples;
        let mut values = Array2::zeros((self.n_features, n_samples));
        let mut labels = LabelMap::new();
        let category_names: Vec<String> = (0..self.n_categories).map(|k| format!("celltype{}", k + 1)).collect();
        let sample_ids: Vec<String> = (0..n_samples).map(|j| format!("sample{:05}", j + 1)).collect();

        for j in 0..n_samples {
            let category = (j < n_labeled).then(|| j / self.samples_per_category);
            for i in 0..self.n_features {
                let base = match category {
                    Some(k) => profiles[[i, k]],
                    None => rng.gen_range(low..=high),
                };
                let noise = if i < n_markers {
                    marker_dist.sample(&mut rng)
                } else {
                    background_dist.sample(&mut rng)
                };
                values[[i, j]] = base * noise;
            }
            match category {
                Some(k) => labels.insert(sample_ids[j].clone(), category_names[k].clone()),
                None => labels.insert(sample_ids[j].clone(), UNASSIGNED_LABEL),
            }
        }

        let feature_ids = (0..self.n_features).map(|i| format!("gene{:04}", i + 1)).collect();
        let matrix = ExpressionMatrix::new(values, feature_ids, sample_ids)?;
        let categories = CategorySet::new(category_names)?;
        log::debug!(
            "Generated {} synthetic samples over {} features ({} markers)",
            n_samples,
            self.n_features,
            n_markers
        );

        Ok(SyntheticData {
            matrix,
            labels,
            categories,
            markers,
        })
    }
}

fn lognormal(sigma: f64) -> Result<LogNormal<f64>, SyntheticError> {
    if !(sigma.is_finite() && sigma >= 0.0) {
        return Err(SyntheticError::InvalidNoise(sigma));
    }
    LogNormal::new(0.0, sigma).map_err(|_| SyntheticError::InvalidNoise(sigma))
}
