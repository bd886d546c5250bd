//! # Composition Estimation
//!
//! Given a reference matrix `X` (features × categories), a weighting vector `g` and
//! mixtures `Y` (features × mixtures), estimates for each mixture column `y` the
//! composition `ĉ` minimizing `‖diag(g)·(y − X·ĉ)‖²`.
//!
//! With `W = diag(g²)` the normal equations are `(XᵀWX)·ĉ = XᵀWy`. The Gram matrix
//! `XᵀWX` does not depend on the mixture, so it is factorized once and reused for every
//! column. The non-negative variant runs a Lawson–Hanson active set iteration on the same
//! normal equations, factorizing only the principal submatrices it needs.

use crate::types::FeatureWeights;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, OwnedRepr};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{CholeskyFactorized, FactorizeC, SolveC, UPLO};
use thiserror::Error;

/// Gram matrices whose estimated reciprocal condition number falls below this are treated
/// as singular to working precision.
pub const MIN_RECIPROCAL_CONDITION: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("The weighting vector contains non-finite values.")]
    NonFiniteWeights,
    #[error(
        "The weighted normal equations are singular to working precision (reciprocal condition estimate {rcond:.3e}){}",
        match .mixture {
            Some(m) => format!(" while solving mixture {m}"),
            None => String::new(),
        }
    )]
    Singular { rcond: f64, mixture: Option<usize> },
    #[error("Triangular solve against the Gram factor failed: {0}")]
    LinearSolve(#[from] LinalgError),
}

/// Anything that can supply a weighting vector: a raw array, `FeatureWeights`, or a
/// trained `Model`.
pub trait WeightSource {
    fn feature_weights(&self) -> ArrayView1<'_, f64>;
}

impl WeightSource for Array1<f64> {
    fn feature_weights(&self) -> ArrayView1<'_, f64> {
        self.view()
    }
}

impl WeightSource for ArrayView1<'_, f64> {
    fn feature_weights(&self) -> ArrayView1<'_, f64> {
        self.view()
    }
}

impl WeightSource for FeatureWeights {
    fn feature_weights(&self) -> ArrayView1<'_, f64> {
        self.as_view()
    }
}

/// Estimates compositions for every column of `mixtures`. With `nonneg` the result is
/// guaranteed to be elementwise non-negative.
pub fn estimate<W: WeightSource + ?Sized>(
    reference: ArrayView2<f64>,
    weights: &W,
    mixtures: ArrayView2<f64>,
    nonneg: bool,
) -> Result<Array2<f64>, EstimationError> {
    Estimator::new(reference, weights.feature_weights())?.solve(mixtures, nonneg)
}

/// A Cholesky-factorized symmetric positive definite matrix.
pub(crate) struct GramFactor {
    cholesky: CholeskyFactorized<OwnedRepr<f64>>,
}

impl GramFactor {
    pub(crate) fn new(gram: &Array2<f64>) -> Result<Self, EstimationError> {
        let cholesky = gram
            .factorizec(UPLO::Lower)
            .map_err(|_| EstimationError::Singular {
                rcond: 0.0,
                mixture: None,
            })?;

        let (min_diag, max_diag) = cholesky
            .factor
            .diag()
            .iter()
            .fold((f64::INFINITY, 0.0_f64), |(lo, hi), &d| (lo.min(d.abs()), hi.max(d.abs())));
        let rcond = if max_diag > 0.0 {
            (min_diag / max_diag).powi(2)
        } else {
            0.0
        };
        if !rcond.is_finite() || rcond < MIN_RECIPROCAL_CONDITION {
            return Err(EstimationError::Singular {
                rcond,
                mixture: None,
            });
        }
        Ok(Self { cholesky })
    }

    /// Solves `L·Lᵀ·x = b` with the stored factor.
    pub(crate) fn solve(&self, rhs: ArrayView1<f64>) -> Result<Array1<f64>, EstimationError> {
        Ok(self.cholesky.solvec(&rhs)?)
    }

    pub(crate) fn solve_matrix(&self, rhs: ArrayView2<f64>) -> Result<Array2<f64>, EstimationError> {
        let mut out = Array2::zeros(rhs.raw_dim());
        for (j, column) in rhs.axis_iter(Axis(1)).enumerate() {
            out.column_mut(j).assign(&self.solve(column)?);
        }
        Ok(out)
    }
}

/// A reference matrix paired with a factorized weighted Gram matrix, ready to solve any
/// number of mixtures.
pub struct Estimator<'a> {
    reference: ArrayView2<'a, f64>,
    squared_weights: Array1<f64>,
    gram: Array2<f64>,
    factor: GramFactor,
}

impl<'a> Estimator<'a> {
    pub fn new(
        reference: ArrayView2<'a, f64>,
        weights: ArrayView1<f64>,
    ) -> Result<Self, EstimationError> {
        Self::with_ridge(reference, weights, 0.0)
    }

    /// Adds `ridge·I` to the Gram matrix before factorizing.
    pub fn with_ridge(
        reference: ArrayView2<'a, f64>,
        weights: ArrayView1<f64>,
        ridge: f64,
    ) -> Result<Self, EstimationError> {
        if weights.len() != reference.nrows() {
            return Err(EstimationError::DimensionMismatch {
                what: "weighting vector length vs reference rows",
                expected: reference.nrows(),
                found: weights.len(),
            });
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(EstimationError::NonFiniteWeights);
        }

        let squared_weights = weights.mapv(|g| g * g);
        let weighted_reference = &reference * &squared_weights.view().insert_axis(Axis(1));
        let mut gram = reference.t().dot(&weighted_reference);
        if ridge > 0.0 {
            gram.diag_mut().mapv_inplace(|d| d + ridge);
        }
        let factor = GramFactor::new(&gram)?;

        Ok(Self {
            reference,
            squared_weights,
            gram,
            factor,
        })
    }

    pub fn n_categories(&self) -> usize {
        self.reference.ncols()
    }

    pub(crate) fn reference(&self) -> ArrayView2<'a, f64> {
        self.reference
    }

    pub(crate) fn squared_weights(&self) -> ArrayView1<'_, f64> {
        self.squared_weights.view()
    }

    pub(crate) fn factor(&self) -> &GramFactor {
        &self.factor
    }

    /// `XᵀWY`, categories × mixtures.
    fn weighted_rhs(&self, mixtures: ArrayView2<f64>) -> Array2<f64> {
        let weighted = &mixtures * &self.squared_weights().insert_axis(Axis(1));
        self.reference.t().dot(&weighted)
    }

    fn check_mixtures(&self, mixtures: ArrayView2<f64>) -> Result<(), EstimationError> {
        if mixtures.nrows() != self.reference.nrows() {
            return Err(EstimationError::DimensionMismatch {
                what: "mixture rows vs reference rows",
                expected: self.reference.nrows(),
                found: mixtures.nrows(),
            });
        }
        Ok(())
    }

    pub fn solve(
        &self,
        mixtures: ArrayView2<f64>,
        nonneg: bool,
    ) -> Result<Array2<f64>, EstimationError> {
        if nonneg {
            self.solve_nonnegative(mixtures)
        } else {
            self.solve_unconstrained(mixtures)
        }
    }

    /// Closed-form weighted least squares, categories × mixtures.
    pub fn solve_unconstrained(
        &self,
        mixtures: ArrayView2<f64>,
    ) -> Result<Array2<f64>, EstimationError> {
        self.check_mixtures(mixtures)?;
        let rhs = self.weighted_rhs(mixtures);
        self.factor.solve_matrix(rhs.view())
    }

    /// Non-negative weighted least squares, categories × mixtures.
    pub fn solve_nonnegative(
        &self,
        mixtures: ArrayView2<f64>,
    ) -> Result<Array2<f64>, EstimationError> {
        self.check_mixtures(mixtures)?;
        let rhs = self.weighted_rhs(mixtures);
        let mut out = Array2::zeros(rhs.raw_dim());
        for (m, column) in rhs.axis_iter(Axis(1)).enumerate() {
            let solution = self.nnls_column(column, m)?;
            out.column_mut(m).assign(&solution);
        }
        Ok(out)
    }

    /// Factor of the Gram submatrix on `free` categories.
    pub(crate) fn restricted_factor(
        &self,
        free: &[usize],
        mixture: usize,
    ) -> Result<GramFactor, EstimationError> {
        let sub = self.gram.select(Axis(0), free).select(Axis(1), free);
        GramFactor::new(&sub).map_err(|err| match err {
            EstimationError::Singular { rcond, .. } => EstimationError::Singular {
                rcond,
                mixture: Some(mixture),
            },
            other => other,
        })
    }

    /// Lawson–Hanson active set iteration in normal-equation form.
    fn nnls_column(&self, rhs: ArrayView1<f64>, mixture: usize) -> Result<Array1<f64>, EstimationError> {
        let k = rhs.len();
        let gram = &self.gram;
        let rhs_scale = rhs.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        let tol = 1e-10 * rhs_scale.max(f64::MIN_POSITIVE);
        let max_outer = 30 * k + 50;

        let mut x = Array1::<f64>::zeros(k);
        let mut passive = vec![false; k];

        for _ in 0..max_outer {
            let gradient = &rhs - &gram.dot(&x);
            let entering = (0..k)
                .filter(|&j| !passive[j])
                .max_by(|&a, &b| gradient[a].total_cmp(&gradient[b]));
            match entering {
                Some(j) if gradient[j] > tol => passive[j] = true,
                _ => return Ok(x.mapv(|v| v.max(0.0))),
            }

            loop {
                let free: Vec<usize> = (0..k).filter(|&j| passive[j]).collect();
                if free.is_empty() {
                    break;
                }
                let sub_rhs = rhs.select(Axis(0), &free);
                let trial = self.restricted_factor(&free, mixture)?.solve(sub_rhs.view())?;

                if trial.iter().all(|&v| v > 0.0) {
                    x.fill(0.0);
                    for (pos, &j) in free.iter().enumerate() {
                        x[j] = trial[pos];
                    }
                    break;
                }

                let mut alpha = 1.0_f64;
                let mut blocking = None;
                for (pos, &j) in free.iter().enumerate() {
                    if trial[pos] <= 0.0 {
                        let denom = x[j] - trial[pos];
                        let ratio = if denom > 0.0 { x[j] / denom } else { 0.0 };
                        if ratio < alpha || blocking.is_none() {
                            alpha = ratio.min(alpha);
                            blocking = Some(j);
                        }
                    }
                }
                for (pos, &j) in free.iter().enumerate() {
                    x[j] += alpha * (trial[pos] - x[j]);
                }
                if let Some(j) = blocking {
                    x[j] = 0.0;
                    passive[j] = false;
                }
                for &j in &free {
                    if x[j] <= 0.0 {
                        x[j] = 0.0;
                        passive[j] = false;
                    }
                }
            }
        }

        log::warn!(
            "Non-negative solve for mixture {} hit its iteration cap; returning the last feasible point",
            mixture
        );
        Ok(x.mapv(|v| v.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_reference(rng: &mut StdRng, features: usize, categories: usize) -> Array2<f64> {
        Array2::from_shape_fn((features, categories), |_| rng.gen_range(0.1_f64..10.0))
    }

    #[test]
    fn unit_weights_recover_noiseless_compositions() {
        let mut rng = StdRng::seed_from_u64(42);
        let x = random_reference(&mut rng, 40, 4);
        let c = array![[0.1, 0.5], [0.2, 0.0], [0.3, 0.25], [0.4, 0.25]];
        let y = x.dot(&c);
        let g = Array1::ones(40);

        for nonneg in [false, true] {
            let c_hat = estimate(x.view(), &g, y.view(), nonneg).unwrap();
            for (a, b) in c_hat.iter().zip(c.iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn gram_factor_solves_reproduce_the_right_hand_side() {
        let mut rng = StdRng::seed_from_u64(3);
        let x = random_reference(&mut rng, 20, 4);
        let gram = x.t().dot(&x);
        let factor = GramFactor::new(&gram).unwrap();

        let b = array![1.0, -2.0, 0.5, 3.0];
        let solved = factor.solve(b.view()).unwrap();
        for (a, e) in gram.dot(&solved).iter().zip(b.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-9);
        }

        let rhs = Array2::from_shape_fn((4, 3), |(i, j)| (i + 2 * j) as f64 - 1.5);
        let block = factor.solve_matrix(rhs.view()).unwrap();
        for (a, e) in gram.dot(&block).iter().zip(rhs.iter()) {
            assert_abs_diff_eq!(*a, *e, epsilon = 1e-9);
        }
    }

    #[test]
    fn weights_rescale_the_residual() {
        let mut rng = StdRng::seed_from_u64(9);
        let x = random_reference(&mut rng, 12, 3);
        let mut y = x.dot(&array![[0.5], [0.3], [0.2]]);
        y[[0, 0]] += 25.0;

        let mut g = Array1::ones(12);
        g[0] = 0.0;
        let c_hat = estimate(x.view(), &g, y.view(), false).unwrap();
        assert_abs_diff_eq!(c_hat[[0, 0]], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(c_hat[[1, 0]], 0.3, epsilon = 1e-9);

        let scaled = g.mapv(|v| 3.0 * v);
        let c_scaled = estimate(x.view(), &scaled, y.view(), false).unwrap();
        for (a, b) in c_hat.iter().zip(c_scaled.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn nonnegative_solution_has_no_negative_entries() {
        let mut rng = StdRng::seed_from_u64(1234);
        let x = random_reference(&mut rng, 30, 5);
        let mut c = Array2::from_shape_fn((5, 25), |_| rng.gen_range(0.0_f64..1.0));
        c[[1, 0]] = -0.5;
        c[[3, 7]] = -0.2;
        let y = x.dot(&c);
        let g = Array1::from_shape_fn(30, |_| rng.gen_range(0.2_f64..2.0));

        let unconstrained = estimate(x.view(), &g, y.view(), false).unwrap();
        assert!(unconstrained[[1, 0]] < 0.0);
        assert!(unconstrained[[3, 7]] < 0.0);

        let constrained = estimate(x.view(), &g, y.view(), true).unwrap();
        assert!(constrained.iter().all(|&v| v >= 0.0));

        let estimator = Estimator::new(x.view(), g.view()).unwrap();
        let w = estimator.squared_weights().to_owned();
        for m in 0..y.ncols() {
            let residual = |c: ArrayView1<f64>| {
                let r = &y.column(m) - &x.dot(&c);
                (&r * &r * &w).sum()
            };
            let best = residual(constrained.column(m));
            let clipped = unconstrained.column(m).mapv(|v| v.max(0.0));
            assert!(best <= residual(clipped.view()) + 1e-8);
        }
    }

    #[test]
    fn singular_gram_is_reported() {
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let y = array![[1.0], [2.0], [3.0]];
        let g = Array1::ones(3);
        assert!(matches!(
            estimate(x.view(), &g, y.view(), false),
            Err(EstimationError::Singular { mixture: None, .. })
        ));

        let independent = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let zero = Array1::zeros(3);
        assert!(matches!(
            estimate(independent.view(), &zero, y.view(), false),
            Err(EstimationError::Singular { .. })
        ));
        let ridged = Estimator::with_ridge(independent.view(), zero.view(), 1e-3).unwrap();
        assert!(ridged.solve(y.view(), false).is_ok());
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let x = Array2::<f64>::ones((4, 2));
        let g = Array1::ones(3);
        let y = Array2::<f64>::ones((4, 1));
        assert!(matches!(
            estimate(x.view(), &g, y.view(), false),
            Err(EstimationError::DimensionMismatch { .. })
        ));
    }
}
