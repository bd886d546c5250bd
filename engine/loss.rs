//! # Correlation Loss
//!
//! The training objective compares true compositions `C` with estimated compositions
//! `Ĉ(g)` through Pearson correlation and adds an L1 penalty on `g`:
//!
//! `L(g) = −mean_j corr(C[·, j], Ĉ(g)[·, j]) + λ·‖g‖₁`
//!
//! The gradient of the smooth term is computed in closed form. Writing `V = ∂L/∂Ĉ`,
//! `U = A⁻¹V` with `A = XᵀWX` and the residuals `R = Y − XĈ`, the derivative with respect
//! to the feature weight is `∂L/∂g_i = 2·g_i·Σ_j (XU)_ij·R_ij`. For the non-negative
//! estimator the same identity holds column by column on the set of positive entries.
//!
//! The correlations are averaged rather than summed. The loss therefore stays within
//! `[−1, 1]` whatever the number of mixtures, and a given λ trades off the same amount of
//! fit against sparsity on a cross-validation fold as on the full training set.

use crate::estimate::{EstimationError, Estimator};
use crate::types::l1_norm;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Vectors whose centered norm falls below this are treated as constant.
const DEGENERATE_NORM: f64 = 1e-12;

/// The smooth loss is a negated mean of correlations, so it never falls below this.
pub const SMOOTH_LOSS_FLOOR: f64 = -1.0;

/// Which vectors are correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationAxis {
    /// Each mixture's composition across categories (one term per mixture).
    #[default]
    Samples,
    /// Each category's abundance across mixtures (one term per category).
    Categories,
}

fn centered(values: ArrayView1<f64>) -> (Array1<f64>, f64) {
    let mean = values.mean().unwrap_or(0.0);
    let centered = values.mapv(|v| v - mean);
    let norm = centered.dot(&centered).sqrt();
    let scale = values.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
    if norm <= DEGENERATE_NORM * scale {
        (centered, 0.0)
    } else {
        (centered, norm)
    }
}

/// Pearson correlation. Returns 0 when either vector has no variance.
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let (a, norm_a) = centered(a);
    let (b, norm_b) = centered(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (a.dot(&b) / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Pearson correlation and its gradient with respect to `estimate`.
fn pearson_with_gradient(truth: ArrayView1<f64>, estimate: ArrayView1<f64>) -> (f64, Array1<f64>) {
    let (a, norm_a) = centered(truth);
    let (b, norm_b) = centered(estimate);
    if norm_a == 0.0 || norm_b == 0.0 {
        return (0.0, Array1::zeros(estimate.len()));
    }
    let corr = a.dot(&b) / (norm_a * norm_b);
    let gradient = &a / (norm_a * norm_b) - &(&b * (corr / (norm_b * norm_b)));
    (corr, gradient)
}

/// Ranks starting at 1, ties sharing their average rank.
fn average_ranks(values: ArrayView1<f64>) -> Array1<f64> {
    let order = (0..values.len())
        .sorted_by(|&a, &b| values[a].total_cmp(&values[b]))
        .collect_vec();
    let mut ranks = Array1::zeros(values.len());
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + end + 1) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

/// Spearman rank correlation. Used for evaluation; the training loss is always Pearson.
pub fn spearman(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    pearson(average_ranks(a).view(), average_ranks(b).view())
}

fn lanes(axis: CorrelationAxis) -> Axis {
    match axis {
        CorrelationAxis::Samples => Axis(1),
        CorrelationAxis::Categories => Axis(0),
    }
}

/// Per-vector correlations between `truth` and `estimate` along `axis`.
pub fn correlations(
    truth: ArrayView2<f64>,
    estimate: ArrayView2<f64>,
    axis: CorrelationAxis,
    correlation: fn(ArrayView1<f64>, ArrayView1<f64>) -> f64,
) -> Array1<f64> {
    let axis = lanes(axis);
    truth
        .axis_iter(axis)
        .zip(estimate.axis_iter(axis))
        .map(|(t, e)| correlation(t, e))
        .collect()
}

/// Mean Pearson correlation between `truth` and `estimate` along `axis`.
pub fn mean_correlation(
    truth: ArrayView2<f64>,
    estimate: ArrayView2<f64>,
    axis: CorrelationAxis,
) -> f64 {
    correlations(truth, estimate, axis, pearson)
        .mean()
        .unwrap_or(0.0)
}

/// `−mean corr` and its gradient with respect to every entry of `estimate`.
fn correlation_loss_gradient(
    truth: ArrayView2<f64>,
    estimate: ArrayView2<f64>,
    axis: CorrelationAxis,
) -> (f64, Array2<f64>) {
    let axis = lanes(axis);
    let terms = truth.len_of(axis);
    let mut gradient = Array2::zeros(estimate.raw_dim());
    if terms == 0 {
        return (0.0, gradient);
    }
    let scale = -1.0 / terms as f64;
    let mut total = 0.0;
    for ((t, e), mut g) in truth
        .axis_iter(axis)
        .zip(estimate.axis_iter(axis))
        .zip(gradient.axis_iter_mut(axis))
    {
        let (corr, d_corr) = pearson_with_gradient(t, e);
        total += corr;
        g.assign(&(d_corr * scale));
    }
    (total * scale, gradient)
}

/// Estimator and correlation options shared by every loss evaluation of a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Estimate compositions under a non-negativity constraint.
    pub nonnegative: bool,
    pub axis: CorrelationAxis,
    /// Added to the diagonal of the weighted Gram matrix.
    pub ridge: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            nonnegative: false,
            axis: CorrelationAxis::Samples,
            ridge: 0.0,
        }
    }
}

impl LossConfig {
    /// A loss over views that may borrow from different owners; it lives as long as the
    /// shortest of them.
    pub fn build<'a, 'r: 'a, 'm: 'a, 'q: 'a>(
        &self,
        reference: ArrayView2<'r, f64>,
        mixtures: ArrayView2<'m, f64>,
        quantities: ArrayView2<'q, f64>,
    ) -> Result<DeconvolutionLoss<'a>, EstimationError> {
        Ok(DeconvolutionLoss::new(reference.reborrow(), mixtures.reborrow(), quantities.reborrow())?
            .with_nonnegative(self.nonnegative)
            .with_axis(self.axis)
            .with_ridge(self.ridge))
    }
}

/// The training objective over one reference matrix and one set of labeled mixtures.
#[derive(Debug, Clone, Copy)]
pub struct DeconvolutionLoss<'a> {
    reference: ArrayView2<'a, f64>,
    mixtures: ArrayView2<'a, f64>,
    quantities: ArrayView2<'a, f64>,
    nonneg: bool,
    axis: CorrelationAxis,
    ridge: f64,
}

impl<'a> DeconvolutionLoss<'a> {
    pub fn new(
        reference: ArrayView2<'a, f64>,
        mixtures: ArrayView2<'a, f64>,
        quantities: ArrayView2<'a, f64>,
    ) -> Result<Self, EstimationError> {
        if mixtures.nrows() != reference.nrows() {
            return Err(EstimationError::DimensionMismatch {
                what: "mixture rows vs reference rows",
                expected: reference.nrows(),
                found: mixtures.nrows(),
            });
        }
        if quantities.nrows() != reference.ncols() {
            return Err(EstimationError::DimensionMismatch {
                what: "quantity rows vs reference columns",
                expected: reference.ncols(),
                found: quantities.nrows(),
            });
        }
        if quantities.ncols() != mixtures.ncols() {
            return Err(EstimationError::DimensionMismatch {
                what: "quantity columns vs mixture columns",
                expected: mixtures.ncols(),
                found: quantities.ncols(),
            });
        }
        Ok(Self {
            reference,
            mixtures,
            quantities,
            nonneg: false,
            axis: CorrelationAxis::Samples,
            ridge: 0.0,
        })
    }

    pub fn with_nonnegative(mut self, nonneg: bool) -> Self {
        self.nonneg = nonneg;
        self
    }

    pub fn with_axis(mut self, axis: CorrelationAxis) -> Self {
        self.axis = axis;
        self
    }

    pub fn with_ridge(mut self, ridge: f64) -> Self {
        self.ridge = ridge;
        self
    }

    pub fn n_features(&self) -> usize {
        self.reference.nrows()
    }

    fn check_weights(&self, g: ArrayView1<f64>) -> Result<(), EstimationError> {
        if g.len() != self.n_features() {
            return Err(EstimationError::DimensionMismatch {
                what: "weighting vector length vs reference rows",
                expected: self.n_features(),
                found: g.len(),
            });
        }
        Ok(())
    }

    /// Estimated compositions for the held mixtures under `g`.
    pub fn estimates(&self, g: ArrayView1<f64>) -> Result<Array2<f64>, EstimationError> {
        Estimator::with_ridge(self.reference, g, self.ridge)?.solve(self.mixtures, self.nonneg)
    }

    /// `−mean corr(C, Ĉ(g))`. Defined as 0 for the all-zero vector.
    pub fn smooth_loss(&self, g: ArrayView1<f64>) -> Result<f64, EstimationError> {
        self.check_weights(g)?;
        if g.iter().all(|&v| v == 0.0) && self.ridge <= 0.0 {
            return Ok(0.0);
        }
        let c_hat = self.estimates(g)?;
        Ok(-mean_correlation(self.quantities, c_hat.view(), self.axis))
    }

    /// Smooth loss plus `λ·‖g‖₁`.
    pub fn objective(&self, g: ArrayView1<f64>, lambda: f64) -> Result<f64, EstimationError> {
        Ok(self.smooth_loss(g)? + lambda * l1_norm(g))
    }

    pub fn smooth_loss_and_gradient(
        &self,
        g: ArrayView1<f64>,
    ) -> Result<(f64, Array1<f64>), EstimationError> {
        self.check_weights(g)?;
        if g.iter().all(|&v| v == 0.0) && self.ridge <= 0.0 {
            return Ok((0.0, Array1::zeros(g.len())));
        }

        let estimator = Estimator::with_ridge(self.reference, g, self.ridge)?;
        let c_hat = estimator.solve(self.mixtures, self.nonneg)?;
        let (value, d_estimate) = correlation_loss_gradient(self.quantities, c_hat.view(), self.axis);

        let adjoint = if self.nonneg {
            restricted_adjoint(&estimator, c_hat.view(), d_estimate.view())?
        } else {
            estimator.factor().solve_matrix(d_estimate.view())?
        };

        let reference = estimator.reference();
        let residuals = &self.mixtures - &reference.dot(&c_hat);
        let projected = reference.dot(&adjoint);
        let per_feature = (&projected * &residuals).sum_axis(Axis(1));
        let gradient = &per_feature * &g.mapv(|v| 2.0 * v);

        Ok((value, gradient))
    }
}

/// Solves `A_FF·u_F = v_F` per column on the free set `F = {k : ĉ_k > 0}`.
fn restricted_adjoint(
    estimator: &Estimator<'_>,
    c_hat: ArrayView2<f64>,
    d_estimate: ArrayView2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    let mut adjoint = Array2::zeros(d_estimate.raw_dim());
    for (m, (column, rhs)) in c_hat
        .axis_iter(Axis(1))
        .zip(d_estimate.axis_iter(Axis(1)))
        .enumerate()
    {
        let free = column.iter().positions(|&v| v > 0.0).collect_vec();
        if free.is_empty() {
            continue;
        }
        let solved = estimator
            .restricted_factor(&free, m)?
            .solve(rhs.select(Axis(0), &free).view())?;
        for (pos, &k) in free.iter().enumerate() {
            adjoint[[k, m]] = solved[pos];
        }
    }
    Ok(adjoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Problem {
        reference: Array2<f64>,
        mixtures: Array2<f64>,
        quantities: Array2<f64>,
    }

    fn problem(seed: u64) -> Problem {
        let mut rng = StdRng::seed_from_u64(seed);
        let (p, k, m) = (15, 3, 12);
        let reference = Array2::from_shape_fn((p, k), |_| rng.gen_range(0.5_f64..5.0));
        let mut quantities = Array2::from_shape_fn((k, m), |_| rng.gen_range(0.05_f64..1.0));
        for mut column in quantities.axis_iter_mut(Axis(1)) {
            let sum = column.sum();
            column /= sum;
        }
        let noise = Array2::from_shape_fn((p, m), |_| rng.gen_range(-0.4_f64..0.4));
        let mixtures = reference.dot(&quantities) + noise;
        Problem {
            reference,
            mixtures,
            quantities,
        }
    }

    fn central_difference(loss: &DeconvolutionLoss<'_>, g: &Array1<f64>, h: f64) -> Array1<f64> {
        Array1::from_shape_fn(g.len(), |i| {
            let mut plus = g.clone();
            let mut minus = g.clone();
            plus[i] += h;
            minus[i] -= h;
            (loss.smooth_loss(plus.view()).unwrap() - loss.smooth_loss(minus.view()).unwrap())
                / (2.0 * h)
        })
    }

    #[test]
    fn pearson_handles_degenerate_vectors() {
        assert_abs_diff_eq!(pearson(array![1.0, 2.0, 3.0].view(), array![2.0, 4.0, 6.0].view()), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pearson(array![1.0, 2.0, 3.0].view(), array![3.0, 2.0, 1.0].view()), -1.0, epsilon = 1e-12);
        assert_eq!(pearson(array![1.0, 1.0, 1.0].view(), array![1.0, 2.0, 3.0].view()), 0.0);
        let (corr, gradient) = pearson_with_gradient(array![0.2, 0.3, 0.5].view(), array![4.0, 4.0, 4.0].view());
        assert_eq!(corr, 0.0);
        assert!(gradient.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn spearman_averages_tied_ranks() {
        assert_eq!(average_ranks(array![10.0, 20.0, 20.0, 5.0].view()), array![2.0, 3.5, 3.5, 1.0]);
        let monotone = spearman(array![1.0, 2.0, 3.0, 4.0].view(), array![1.0, 8.0, 27.0, 64.0].view());
        assert_abs_diff_eq!(monotone, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn gradient_matches_central_differences() {
        let data = problem(17);
        let mut rng = StdRng::seed_from_u64(99);
        let g = Array1::from_shape_fn(15, |_| rng.gen_range(0.5_f64..1.5));

        for axis in [CorrelationAxis::Samples, CorrelationAxis::Categories] {
            let loss = DeconvolutionLoss::new(
                data.reference.view(),
                data.mixtures.view(),
                data.quantities.view(),
            )
            .unwrap()
            .with_axis(axis);

            let (value, analytic) = loss.smooth_loss_and_gradient(g.view()).unwrap();
            assert_abs_diff_eq!(value, loss.smooth_loss(g.view()).unwrap(), epsilon = 1e-12);
            let numeric = central_difference(&loss, &g, 1e-6);
            let scale = numeric.iter().fold(1e-8_f64, |acc, v| acc.max(v.abs()));
            for (a, n) in analytic.iter().zip(numeric.iter()) {
                assert!((a - n).abs() <= 1e-5 * scale, "analytic {a} vs numeric {n}");
            }
        }
    }

    #[test]
    fn nonnegative_gradient_matches_central_differences() {
        let mut data = problem(5);
        for m in 0..data.quantities.ncols() {
            if m % 3 == 0 {
                data.quantities[[2, m]] = 0.0;
                let sum = data.quantities.column(m).sum();
                data.quantities.column_mut(m).mapv_inplace(|v| v / sum);
                let clean = data.reference.dot(&data.quantities.column(m));
                let shifted = &clean - &(data.reference.column(2).to_owned() * 0.1);
                data.mixtures.column_mut(m).assign(&shifted.mapv(|v| v.max(0.0)));
            }
        }
        let loss = DeconvolutionLoss::new(
            data.reference.view(),
            data.mixtures.view(),
            data.quantities.view(),
        )
        .unwrap()
        .with_nonnegative(true);

        let g = Array1::from_shape_fn(15, |i| 0.6 + 0.05 * i as f64);
        let estimates = loss.estimates(g.view()).unwrap();
        assert!(estimates.iter().all(|&v| v >= 0.0));
        assert!(estimates.iter().any(|&v| v == 0.0));

        let (_, analytic) = loss.smooth_loss_and_gradient(g.view()).unwrap();
        let numeric = central_difference(&loss, &g, 1e-7);
        let scale = numeric.iter().fold(1e-8_f64, |acc, v| acc.max(v.abs()));
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert!((a - n).abs() <= 1e-4 * scale, "analytic {a} vs numeric {n}");
        }
    }

    #[test]
    fn perfect_estimates_reach_minus_one_and_zero_weights_are_neutral() {
        let reference = array![[4.0, 0.5], [1.0, 3.0], [0.5, 0.5], [2.0, 1.0]];
        let quantities = array![[0.2, 0.7, 0.4], [0.8, 0.3, 0.6]];
        let mixtures = reference.dot(&quantities);
        let loss = DeconvolutionLoss::new(reference.view(), mixtures.view(), quantities.view()).unwrap();

        let ones = Array1::ones(4);
        assert_abs_diff_eq!(loss.smooth_loss(ones.view()).unwrap(), -1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(loss.objective(ones.view(), 0.25).unwrap(), 0.0, epsilon = 1e-10);

        let zeros = Array1::zeros(4);
        let (value, gradient) = loss.smooth_loss_and_gradient(zeros.view()).unwrap();
        assert_eq!(value, 0.0);
        assert!(gradient.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn duplicating_every_mixture_leaves_the_loss_unchanged() {
        let data = problem(23);
        let g = Array1::from_shape_fn(15, |i| 0.5 + 0.1 * (i % 4) as f64);
        let single = DeconvolutionLoss::new(
            data.reference.view(),
            data.mixtures.view(),
            data.quantities.view(),
        )
        .unwrap();

        let mixtures = ndarray::concatenate![Axis(1), data.mixtures, data.mixtures];
        let quantities = ndarray::concatenate![Axis(1), data.quantities, data.quantities];
        let doubled = LossConfig::default()
            .build(data.reference.view(), mixtures.view(), quantities.view())
            .unwrap();

        let (value, gradient) = single.smooth_loss_and_gradient(g.view()).unwrap();
        let (doubled_value, doubled_gradient) = doubled.smooth_loss_and_gradient(g.view()).unwrap();
        assert_abs_diff_eq!(value, doubled_value, epsilon = 1e-12);
        for (a, b) in gradient.iter().zip(doubled_gradient.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
        assert!(value >= SMOOTH_LOSS_FLOOR);
    }
}
