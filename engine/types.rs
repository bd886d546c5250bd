use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// The per-feature weighting vector `g`, aligned index-for-index with the rows of the
/// reference matrix.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeights(pub Array1<f64>);

impl FeatureWeights {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    /// The untrained baseline: every feature weighted equally.
    pub fn ones(len: usize) -> Self {
        Self(Array1::ones(len))
    }

    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }

    pub fn l1_norm(&self) -> f64 {
        l1_norm(self.0.view())
    }

    pub fn nonzero_count(&self) -> usize {
        self.0.iter().filter(|&&v| v != 0.0).count()
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|&v| v == 0.0)
    }
}

impl Deref for FeatureWeights {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for FeatureWeights {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for FeatureWeights {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<FeatureWeights> for Array1<f64> {
    fn from(values: FeatureWeights) -> Self {
        values.0
    }
}

pub fn l1_norm(values: ArrayView1<f64>) -> f64 {
    values.iter().map(|v| v.abs()).sum()
}

pub fn l2_norm(values: ArrayView1<f64>) -> f64 {
    values.dot(&values).sqrt()
}
