//! # Expression Matrix
//!
//! Dense features × samples expression values together with stable row and column
//! identifiers. Everything downstream (sampling, mixing, estimation) works on column
//! indices into this structure; identifiers are only resolved at the boundary.

use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Expression matrix has {found} {axis}, but {expected} identifiers were supplied.")]
    DimensionMismatch {
        axis: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Identifier '{0}' appears more than once.")]
    DuplicateId(String),
    #[error("Non-finite value at feature '{feature}', sample '{sample}'.")]
    NonFinite { feature: String, sample: String },
    #[error("Negative value {value} at feature '{feature}', sample '{sample}'.")]
    Negative {
        feature: String,
        sample: String,
        value: f64,
    },
    #[error("Normalization total must be positive and finite, got {0}.")]
    InvalidTotal(f64),
}

/// A validated, non-negative expression matrix with unique identifiers.
#[derive(Debug, Clone)]
pub struct ExpressionMatrix {
    values: Array2<f64>,
    feature_ids: Vec<String>,
    sample_ids: Vec<String>,
    sample_index: AHashMap<String, usize>,
}

impl ExpressionMatrix {
    pub fn new(
        values: Array2<f64>,
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self, MatrixError> {
        if values.nrows() != feature_ids.len() {
            return Err(MatrixError::DimensionMismatch {
                axis: "rows",
                expected: feature_ids.len(),
                found: values.nrows(),
            });
        }
        if values.ncols() != sample_ids.len() {
            return Err(MatrixError::DimensionMismatch {
                axis: "columns",
                expected: sample_ids.len(),
                found: values.ncols(),
            });
        }

        let mut feature_seen = AHashMap::with_capacity(feature_ids.len());
        for (i, id) in feature_ids.iter().enumerate() {
            if feature_seen.insert(id.as_str(), i).is_some() {
                return Err(MatrixError::DuplicateId(id.clone()));
            }
        }
        let mut sample_index = AHashMap::with_capacity(sample_ids.len());
        for (j, id) in sample_ids.iter().enumerate() {
            if sample_index.insert(id.clone(), j).is_some() {
                return Err(MatrixError::DuplicateId(id.clone()));
            }
        }

        for ((i, j), &value) in values.indexed_iter() {
            if !value.is_finite() {
                return Err(MatrixError::NonFinite {
                    feature: feature_ids[i].clone(),
                    sample: sample_ids[j].clone(),
                });
            }
            if value < 0.0 {
                return Err(MatrixError::Negative {
                    feature: feature_ids[i].clone(),
                    sample: sample_ids[j].clone(),
                    value,
                });
            }
        }

        Ok(Self {
            values,
            feature_ids,
            sample_ids,
            sample_index,
        })
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_features(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.values.ncols()
    }

    pub fn sample_position(&self, id: &str) -> Option<usize> {
        self.sample_index.get(id).copied()
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, f64> {
        self.values.column(index)
    }

    /// Returns a new matrix restricted to the given sample columns, in the given order.
    pub fn select_samples(&self, columns: &[usize]) -> Result<Self, MatrixError> {
        let values = self.values.select(Axis(1), columns);
        let sample_ids = columns.iter().map(|&j| self.sample_ids[j].clone()).collect();
        Self::new(values, self.feature_ids.clone(), sample_ids)
    }

    /// Rescales every column to sum to `total` (defaults to the number of features).
    pub fn normalize_to_count(&self, total: Option<f64>) -> Result<Self, MatrixError> {
        let total = resolve_total(total, self.n_features())?;
        let mut values = self.values.clone();
        normalize_columns(&mut values, total);
        Ok(Self {
            values,
            feature_ids: self.feature_ids.clone(),
            sample_ids: self.sample_ids.clone(),
            sample_index: self.sample_index.clone(),
        })
    }
}

pub(crate) fn resolve_total(total: Option<f64>, n_features: usize) -> Result<f64, MatrixError> {
    let total = total.unwrap_or(n_features as f64);
    if !total.is_finite() || total <= 0.0 {
        return Err(MatrixError::InvalidTotal(total));
    }
    Ok(total)
}

/// Count-normalizes each column in place. All-zero columns are left untouched.
pub fn normalize_columns(values: &mut Array2<f64>, total: f64) {
    for column in values.axis_iter_mut(Axis(1)) {
        normalize_column(column, total);
    }
}

pub(crate) fn normalize_column(mut column: ArrayViewMut1<f64>, total: f64) {
    let sum = column.sum();
    if sum > 0.0 {
        column.mapv_inplace(|v| v * total / sum);
    }
}

/// Average of the selected columns.
pub(crate) fn column_mean(values: ArrayView2<f64>, columns: &[usize]) -> Array1<f64> {
    let mut acc = Array1::zeros(values.nrows());
    for &j in columns {
        acc += &values.column(j);
    }
    if !columns.is_empty() {
        acc /= columns.len() as f64;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn rejects_duplicate_and_negative_entries() {
        let values = array![[1.0, 2.0], [3.0, 4.0]];
        let dup = ExpressionMatrix::new(
            values.clone(),
            ids("g", 2),
            vec!["s".to_string(), "s".to_string()],
        );
        assert!(matches!(dup, Err(MatrixError::DuplicateId(id)) if id == "s"));

        let negative = ExpressionMatrix::new(array![[1.0, -2.0], [3.0, 4.0]], ids("g", 2), ids("s", 2));
        assert!(matches!(negative, Err(MatrixError::Negative { .. })));

        let shape = ExpressionMatrix::new(values, ids("g", 3), ids("s", 2));
        assert!(matches!(
            shape,
            Err(MatrixError::DimensionMismatch { axis: "rows", .. })
        ));
    }

    #[test]
    fn count_normalization_defaults_to_feature_count() {
        let m = ExpressionMatrix::new(
            array![[1.0, 0.0, 5.0], [3.0, 0.0, 5.0], [4.0, 0.0, 0.0]],
            ids("g", 3),
            ids("s", 3),
        )
        .unwrap();
        let normalized = m.normalize_to_count(None).unwrap();
        assert_abs_diff_eq!(normalized.column(0).sum(), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalized.column(2).sum(), 3.0, epsilon = 1e-12);
        assert_eq!(normalized.column(1).sum(), 0.0);
        assert_abs_diff_eq!(normalized.values()[[0, 0]], 0.375, epsilon = 1e-12);

        assert!(matches!(
            m.normalize_to_count(Some(0.0)),
            Err(MatrixError::InvalidTotal(_))
        ));
    }

    #[test]
    fn select_samples_keeps_identifiers_aligned() {
        let m = ExpressionMatrix::new(
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
            ids("g", 2),
            ids("s", 3),
        )
        .unwrap();
        let sub = m.select_samples(&[2, 0]).unwrap();
        assert_eq!(sub.sample_ids(), &["s3".to_string(), "s1".to_string()]);
        assert_eq!(sub.values()[[1, 0]], 6.0);
        assert_eq!(sub.sample_position("s1"), Some(1));
        assert_eq!(m.sample_position("missing"), None);
    }
}
