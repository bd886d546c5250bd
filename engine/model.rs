use crate::estimate::{EstimationError, Estimator, WeightSource};
use crate::loss::LossConfig;
use crate::matrix::ExpressionMatrix;
use crate::optimize::{ConvergenceStatus, FistaResult};
use crate::types::FeatureWeights;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("The weighting vector has {found} entries, but {expected} feature identifiers were supplied.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Feature '{0}' used by the model is missing from the supplied matrix.")]
    MissingFeature(String),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
}

/// A trained weighting vector together with everything needed to apply it.
/// Read-only once built.
#[derive(Debug, Clone)]
pub struct Model {
    pub weights: FeatureWeights,
    /// The regularization strength the weights were trained with.
    pub lambda: f64,
    /// Row order of `weights` and of every reference matrix used with them.
    pub feature_ids: Vec<String>,
    pub categories: Vec<String>,
    pub status: ConvergenceStatus,
    pub iterations: usize,
    pub loss_trace: Vec<f64>,
    pub weights_trace: Option<Vec<Array1<f64>>>,
    pub loss: LossConfig,
}

impl Model {
    pub fn from_fit(
        fit: FistaResult,
        lambda: f64,
        feature_ids: Vec<String>,
        categories: Vec<String>,
        loss: LossConfig,
    ) -> Result<Self, ModelError> {
        if fit.weights.len() != feature_ids.len() {
            return Err(ModelError::FeatureCountMismatch {
                expected: feature_ids.len(),
                found: fit.weights.len(),
            });
        }
        Ok(Self {
            weights: fit.weights,
            lambda,
            feature_ids,
            categories,
            status: fit.status,
            iterations: fit.iterations,
            loss_trace: fit.loss_trace,
            weights_trace: fit.weights_trace,
            loss,
        })
    }

    pub fn nonzero_count(&self) -> usize {
        self.weights.nonzero_count()
    }

    /// Identifiers of the features with a non-zero weight, in model order.
    pub fn selected_features(&self) -> Vec<&str> {
        self.feature_ids
            .iter()
            .zip(self.weights.iter())
            .filter(|(_, w)| **w != 0.0)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Deconvolves `mixtures` against `reference` with the learned weights, using the
    /// estimator options the model was trained with.
    pub fn estimate(
        &self,
        reference: ArrayView2<f64>,
        mixtures: ArrayView2<f64>,
    ) -> Result<Array2<f64>, EstimationError> {
        Estimator::with_ridge(reference, self.weights.as_view(), self.loss.ridge)?
            .solve(mixtures, self.loss.nonnegative)
    }

    /// The rows of `matrix` reordered to the model's feature order.
    pub fn align_features(&self, matrix: &ExpressionMatrix) -> Result<Array2<f64>, ModelError> {
        let positions: AHashMap<&str, usize> = matrix
            .feature_ids()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let rows = self
            .feature_ids
            .iter()
            .map(|id| {
                positions
                    .get(id.as_str())
                    .copied()
                    .ok_or_else(|| ModelError::MissingFeature(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(matrix.values().select(Axis(0), &rows))
    }
}

impl WeightSource for Model {
    fn feature_weights(&self) -> ArrayView1<'_, f64> {
        self.weights.as_view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::estimate;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn model(weights: Array1<f64>) -> Model {
        let n = weights.len();
        let fit = FistaResult {
            weights: FeatureWeights::new(weights),
            status: ConvergenceStatus::Converged,
            iterations: 3,
            loss_trace: vec![-0.5, -0.8, -0.9],
            weights_trace: None,
            restarts: 0,
            step: 1.0,
        };
        Model::from_fit(
            fit,
            0.01,
            (0..n).map(|i| format!("g{i}")).collect(),
            vec!["A".into(), "B".into()],
            LossConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn model_and_raw_weights_estimate_identically() {
        let m = model(array![1.0, 0.0, 2.0, 0.5]);
        assert_eq!(m.nonzero_count(), 3);
        assert_eq!(m.selected_features(), vec!["g0", "g2", "g3"]);

        let reference = array![[3.0, 0.5], [1.0, 1.0], [0.2, 4.0], [1.0, 2.0]];
        let mixtures = reference.dot(&array![[0.3], [0.7]]);
        let via_model = m.estimate(reference.view(), mixtures.view()).unwrap();
        let via_source = estimate(reference.view(), &m, mixtures.view(), false).unwrap();
        assert_abs_diff_eq!(via_model[[0, 0]], 0.3, epsilon = 1e-10);
        assert_abs_diff_eq!(via_model[[1, 0]], via_source[[1, 0]], epsilon = 1e-12);
    }

    #[test]
    fn features_are_aligned_by_identifier() {
        let m = model(array![1.0, 1.0, 1.0]);
        let matrix = ExpressionMatrix::new(
            array![[20.0, 21.0], [0.0, 1.0], [10.0, 11.0]],
            vec!["g2".into(), "g0".into(), "g1".into()],
            vec!["s1".into(), "s2".into()],
        )
        .unwrap();
        let aligned = m.align_features(&matrix).unwrap();
        assert_eq!(aligned, array![[0.0, 1.0], [10.0, 11.0], [20.0, 21.0]]);

        let missing = ExpressionMatrix::new(
            array![[1.0], [2.0]],
            vec!["g0".into(), "g1".into()],
            vec!["s1".into()],
        )
        .unwrap();
        assert!(matches!(
            m.align_features(&missing),
            Err(ModelError::MissingFeature(id)) if id == "g2"
        ));
    }

    #[test]
    fn mismatched_feature_ids_are_rejected() {
        let fit = FistaResult {
            weights: FeatureWeights::ones(3),
            status: ConvergenceStatus::MaxIterationsReached,
            iterations: 10,
            loss_trace: vec![0.0],
            weights_trace: None,
            restarts: 0,
            step: 1.0,
        };
        let result = Model::from_fit(fit, 0.1, vec!["a".into()], Vec::new(), LossConfig::default());
        assert!(matches!(
            result,
            Err(ModelError::FeatureCountMismatch { expected: 1, found: 3 })
        ));
    }
}
