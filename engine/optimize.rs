//! # Proximal Gradient Training
//!
//! Learns the weighting vector `g` by minimizing `F(g) = f(g) + λ·‖g‖₁`, where `f` is the
//! smooth correlation loss, with an accelerated proximal gradient method (FISTA):
//!
//! 1. Evaluate `∇f` at the momentum point `z_k`.
//! 2. Take the step `z_k − t·∇f(z_k)` and soft-threshold it with `λ·t`. With backtracking the
//!    step `t` shrinks until `F(p) ≤ F(z_k) − ‖p − z_k‖² / (2t)`.
//! 3. Advance the momentum coefficient `θ_{k+1} = (1 + √(1 + 4θ_k²)) / 2` and extrapolate
//!    `z_{k+1} = g_{k+1} + ((θ_k − 1)/θ_{k+1})·(g_{k+1} − g_k)`.
//!
//! `f` is invariant to rescaling `g`, so with renormalization every point the method
//! evaluates, momentum points included, is first mapped to `‖g‖₂ = √p`. The decrease test
//! then compares objectives on the same scale the proximal step produced.
//!
//! A candidate whose objective is worse than the current one triggers a restart: momentum
//! is dropped and the step is repeated from `g_k`. If even that plain step cannot descend,
//! the run reports [`ConvergenceStatus::Stalled`]. Because `F(0) = 0`, any iterate scoring
//! `F(g) ≥ 0` under `λ > 0` is replaced by the all-zero vector. All state lives in the
//! local run; nothing is shared between calls.

use crate::estimate::EstimationError;
use crate::loss::{DeconvolutionLoss, SMOOTH_LOSS_FLOOR};
use crate::types::{FeatureWeights, l1_norm, l2_norm};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on step halvings within one iteration.
const MAX_BACKTRACKS: usize = 60;

#[derive(Error, Debug)]
pub enum OptimizationError {
    #[error("Regularization strength must be finite and non-negative, got {0}.")]
    InvalidLambda(f64),
    #[error("The starting vector must be finite and contain at least one non-zero entry.")]
    InvalidStart,
    #[error("Starting vector has {found} entries but the reference has {expected} features.")]
    StartLengthMismatch { expected: usize, found: usize },
    #[error("Invalid step size configuration: {0}")]
    InvalidStep(String),
    #[error("The loss at the starting vector is not finite: {0}")]
    SingularStart(#[source] EstimationError),
    #[error(transparent)]
    Estimation(#[from] EstimationError),
}

/// How the proximal step length is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSize {
    /// A constant step.
    Fixed { step: f64 },
    /// Start from `initial` and multiply by `shrink` until sufficient decrease holds.
    Backtracking { initial: f64, shrink: f64 },
}

impl Default for StepSize {
    fn default() -> Self {
        Self::Backtracking {
            initial: 1.0,
            shrink: 0.5,
        }
    }
}

impl StepSize {
    pub fn initial(&self) -> f64 {
        match *self {
            Self::Fixed { step } => step,
            Self::Backtracking { initial, .. } => initial,
        }
    }

    pub fn validate(&self) -> Result<(), OptimizationError> {
        match *self {
            Self::Fixed { step } if !(step.is_finite() && step > 0.0) => Err(
                OptimizationError::InvalidStep(format!("fixed step must be positive, got {step}")),
            ),
            Self::Backtracking { initial, shrink } => {
                if !(initial.is_finite() && initial > 0.0) {
                    return Err(OptimizationError::InvalidStep(format!(
                        "initial step must be positive, got {initial}"
                    )));
                }
                if !(shrink > 0.0 && shrink < 1.0) {
                    return Err(OptimizationError::InvalidStep(format!(
                        "shrink factor must lie in (0, 1), got {shrink}"
                    )));
                }
                Ok(())
            }
            Self::Fixed { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FistaConfig {
    pub max_iterations: usize,
    /// Stop once `|F_k − F_{k+1}| / max(|F_k|, 1e-12)` falls below this.
    pub tolerance: f64,
    pub step: StepSize,
    /// A candidate may exceed the current objective by this much before momentum is reset.
    pub restart_tolerance: f64,
    /// Rescale every evaluated point to `‖g‖₂ = √p`.
    pub renormalize: bool,
    /// Use the non-negative proximal operator `max(x − λt, 0)`.
    pub nonnegative_weights: bool,
    /// Record `g` after every iteration.
    pub keep_weights_trace: bool,
}

impl Default for FistaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            step: StepSize::default(),
            restart_tolerance: 0.0,
            renormalize: true,
            nonnegative_weights: false,
            keep_weights_trace: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceStatus {
    /// The relative objective change fell below the tolerance, or the run reached the
    /// all-zero vector.
    Converged,
    MaxIterationsReached,
    /// No step from the current point decreased the objective before the tolerance was met.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct FistaResult {
    pub weights: FeatureWeights,
    pub status: ConvergenceStatus,
    pub iterations: usize,
    /// Objective value at the start and after every accepted iteration.
    pub loss_trace: Vec<f64>,
    pub weights_trace: Option<Vec<Array1<f64>>>,
    pub restarts: usize,
    /// The step length in use when the run ended.
    pub step: f64,
}

impl FistaResult {
    /// Final objective value, including the L1 term.
    pub fn objective(&self) -> f64 {
        self.loss_trace.last().copied().unwrap_or(f64::INFINITY)
    }

    /// The all-zero solution, which scores `F(0) = 0` at every λ.
    fn all_zero(n_features: usize, config: &FistaConfig) -> Self {
        let zeros = Array1::zeros(n_features);
        Self {
            weights_trace: config.keep_weights_trace.then(|| vec![zeros.clone()]),
            weights: FeatureWeights::new(zeros),
            status: ConvergenceStatus::Converged,
            iterations: 0,
            loss_trace: vec![0.0],
            restarts: 0,
            step: config.step.initial(),
        }
    }
}

/// Soft-thresholding, optionally clamped at zero.
pub fn soft_threshold(values: ArrayView1<f64>, threshold: f64, nonnegative: bool) -> Array1<f64> {
    values.mapv(|v| {
        let shrunk = v.abs() - threshold;
        if shrunk <= 0.0 {
            0.0
        } else if nonnegative {
            if v > 0.0 { shrunk } else { 0.0 }
        } else {
            shrunk.copysign(v)
        }
    })
}

fn renormalized(g: Array1<f64>) -> Array1<f64> {
    let norm = l2_norm(g.view());
    if norm > 0.0 {
        let target = (g.len() as f64).sqrt();
        g * (target / norm)
    } else {
        g
    }
}

/// Maps singular estimator states to an infinite loss so the search steps away from them.
fn finite_or_infinite<T>(
    result: Result<T, EstimationError>,
    infinite: T,
) -> Result<T, OptimizationError> {
    match result {
        Ok(value) => Ok(value),
        Err(EstimationError::Singular { .. }) => Ok(infinite),
        Err(err) => Err(err.into()),
    }
}

/// The smallest λ at which a run from `start` is certain to end at the all-zero vector.
///
/// With renormalization every non-zero iterate has `‖g‖₁ ≥ ‖g‖₂ = √p` while the smooth
/// loss never drops below [`SMOOTH_LOSS_FLOOR`], so from `λ = −floor / √p` upward every
/// non-zero point scores at least `F(0) = 0` and the run moves to zero on its first
/// iteration. The bound depends on neither the data nor the number of mixtures, so it
/// zeroes every cross-validation fold as well as the full fit. Without renormalization it
/// is the smallest λ at which the first proximal step from `start` zeroes every entry.
pub fn lambda_max(
    loss: &DeconvolutionLoss<'_>,
    start: ArrayView1<f64>,
    config: &FistaConfig,
) -> Result<f64, OptimizationError> {
    if config.renormalize {
        return Ok(-SMOOTH_LOSS_FLOOR / (loss.n_features() as f64).sqrt());
    }
    let step = config.step.initial();
    let (_, gradient) = loss
        .smooth_loss_and_gradient(start)
        .map_err(OptimizationError::SingularStart)?;
    let moved = &start - &(&gradient * step);
    Ok(moved.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())) / step)
}

struct Fista<'l, 'a> {
    loss: &'l DeconvolutionLoss<'a>,
    lambda: f64,
    config: &'l FistaConfig,
    /// Entries outside the support are held at zero.
    support: Option<&'l [bool]>,
}

struct Candidate {
    weights: Array1<f64>,
    objective: f64,
    step: f64,
    first_try: bool,
}

impl Fista<'_, '_> {
    fn objective(&self, g: ArrayView1<f64>) -> Result<f64, OptimizationError> {
        let smooth = finite_or_infinite(self.loss.smooth_loss(g), f64::INFINITY)?;
        Ok(smooth + self.lambda * l1_norm(g))
    }

    /// Applies the support restriction, then renormalization when configured.
    fn project(&self, mut g: Array1<f64>) -> Array1<f64> {
        if let Some(support) = self.support {
            for (value, &keep) in g.iter_mut().zip(support) {
                if !keep {
                    *value = 0.0;
                }
            }
        }
        if self.config.renormalize {
            renormalized(g)
        } else {
            g
        }
    }

    fn proposal(&self, z: ArrayView1<f64>, gradient: &Array1<f64>, t: f64) -> Array1<f64> {
        let moved = &z - &(gradient * t);
        self.project(soft_threshold(
            moved.view(),
            self.lambda * t,
            self.config.nonnegative_weights,
        ))
    }

    /// One proximal gradient step from the projected point `z`. Returns `None` when `z` is
    /// singular or when backtracking finds no step with sufficient decrease.
    fn step_from(&self, z: ArrayView1<f64>, step: f64) -> Result<Option<Candidate>, OptimizationError> {
        let evaluated = finite_or_infinite(self.loss.smooth_loss_and_gradient(z).map(Some), None)?;
        let Some((f_z, gradient)) = evaluated else {
            return Ok(None);
        };

        let shrink = match self.config.step {
            StepSize::Fixed { .. } => {
                let weights = self.proposal(z, &gradient, step);
                let objective = self.objective(weights.view())?;
                return Ok(Some(Candidate {
                    weights,
                    objective,
                    step,
                    first_try: true,
                }));
            }
            StepSize::Backtracking { shrink, .. } => shrink,
        };

        let objective_z = f_z + self.lambda * l1_norm(z);
        let mut t = step;
        for attempt in 0..MAX_BACKTRACKS {
            let weights = self.proposal(z, &gradient, t);
            let objective = self.objective(weights.view())?;
            let moved = &weights - &z;
            if objective <= objective_z - moved.dot(&moved) / (2.0 * t) {
                return Ok(Some(Candidate {
                    weights,
                    objective,
                    step: t,
                    first_try: attempt == 0,
                }));
            }
            t *= shrink;
        }
        log::debug!("Backtracking exhausted at step {:.3e} for λ = {:.4e}", t, self.lambda);
        Ok(None)
    }

    fn run(&self, start: ArrayView1<f64>) -> Result<FistaResult, OptimizationError> {
        let config = self.config;
        let mut g = self.project(start.to_owned());
        let mut current = self.objective(g.view())?;
        if !current.is_finite() {
            return Err(self
                .loss
                .smooth_loss(g.view())
                .err()
                .map_or(OptimizationError::InvalidStart, OptimizationError::SingularStart));
        }

        let mut z = g.clone();
        let mut theta = 1.0_f64;
        let mut step = config.step.initial();
        let mut loss_trace = vec![current];
        let mut weights_trace = config.keep_weights_trace.then(|| vec![g.clone()]);
        let mut restarts = 0;
        let mut iterations = 0;
        let mut status = ConvergenceStatus::MaxIterationsReached;

        while iterations < config.max_iterations {
            iterations += 1;

            if self.lambda > 0.0 && current >= 0.0 {
                g.fill(0.0);
                current = 0.0;
                loss_trace.push(current);
                if let Some(trace) = weights_trace.as_mut() {
                    trace.push(g.clone());
                }
                log::debug!("Every non-zero iterate scores above F(0) at λ = {:.4e}", self.lambda);
                status = ConvergenceStatus::Converged;
                break;
            }

            let mut plain = z == g;
            let mut candidate = if plain {
                self.step_from(g.view(), step)?
            } else {
                let momentum_point = self.project(z.clone());
                self.step_from(momentum_point.view(), step)?
            };
            let needs_restart = match &candidate {
                Some(c) => c.objective > current + config.restart_tolerance,
                None => true,
            };
            if needs_restart && !plain {
                restarts += 1;
                theta = 1.0;
                z.assign(&g);
                plain = true;
                candidate = self.step_from(g.view(), step)?;
            }
            let Some(candidate) = candidate else {
                status = ConvergenceStatus::Stalled;
                break;
            };
            if plain && candidate.objective > current {
                step = candidate.step;
                status = ConvergenceStatus::Stalled;
                break;
            }

            step = match config.step {
                StepSize::Backtracking { shrink, .. } if candidate.first_try => candidate.step / shrink,
                _ => candidate.step,
            };
            let previous = std::mem::replace(&mut g, candidate.weights);
            let change = (current - candidate.objective).abs() / current.abs().max(1e-12);
            current = candidate.objective;
            loss_trace.push(current);
            if let Some(trace) = weights_trace.as_mut() {
                trace.push(g.clone());
            }

            if g.iter().all(|&v| v == 0.0) {
                log::debug!("Proximal step zeroed every weight at λ = {:.4e}", self.lambda);
                status = ConvergenceStatus::Converged;
                break;
            }
            if change < config.tolerance {
                status = ConvergenceStatus::Converged;
                break;
            }

            let theta_next = (1.0 + (1.0 + 4.0 * theta * theta).sqrt()) / 2.0;
            let momentum = (theta - 1.0) / theta_next;
            z = &g + &((&g - &previous) * momentum);
            theta = theta_next;
        }

        log::debug!(
            "FISTA at λ = {:.4e}: {:?} after {} iterations ({} restarts), objective {:.6}",
            self.lambda,
            status,
            iterations,
            restarts,
            current
        );

        Ok(FistaResult {
            weights: FeatureWeights::new(g),
            status,
            iterations,
            loss_trace,
            weights_trace,
            restarts,
            step,
        })
    }
}

fn validate(
    loss: &DeconvolutionLoss<'_>,
    lambda: f64,
    start: ArrayView1<f64>,
    config: &FistaConfig,
) -> Result<(), OptimizationError> {
    if !(lambda.is_finite() && lambda >= 0.0) {
        return Err(OptimizationError::InvalidLambda(lambda));
    }
    if start.len() != loss.n_features() {
        return Err(OptimizationError::StartLengthMismatch {
            expected: loss.n_features(),
            found: start.len(),
        });
    }
    if start.iter().any(|v| !v.is_finite()) || start.iter().all(|&v| v == 0.0) {
        return Err(OptimizationError::InvalidStart);
    }
    config.step.validate()
}

/// Minimizes `loss + λ·‖g‖₁` starting from `start`.
pub fn fista(
    loss: &DeconvolutionLoss<'_>,
    lambda: f64,
    start: ArrayView1<f64>,
    config: &FistaConfig,
) -> Result<FistaResult, OptimizationError> {
    validate(loss, lambda, start, config)?;
    Fista {
        loss,
        lambda,
        config,
        support: None,
    }
    .run(start)
}

/// Runs `fista` for each λ in the given order.
///
/// With `warm_start`, each run begins at the previous solution. When λ does not decrease,
/// entries the previous solution zeroed stay at zero, so along an ascending grid the number
/// of non-zero weights never grows and an all-zero solution persists. When λ decreases the
/// run is warm-started without that restriction, and from `start` if the previous solution
/// is all zero.
pub fn fista_path(
    loss: &DeconvolutionLoss<'_>,
    lambdas: &[f64],
    start: ArrayView1<f64>,
    config: &FistaConfig,
    warm_start: bool,
) -> Result<Vec<FistaResult>, OptimizationError> {
    let mut results: Vec<FistaResult> = Vec::with_capacity(lambdas.len());
    for (i, &lambda) in lambdas.iter().enumerate() {
        let previous = i.checked_sub(1).map(|j| (lambdas[j], &results[j]));
        let result = path_point(loss, lambda, previous, start, config, warm_start)?;
        results.push(result);
    }
    Ok(results)
}

/// One point of a λ path, given the λ and solution of the point before it.
pub fn path_point(
    loss: &DeconvolutionLoss<'_>,
    lambda: f64,
    previous: Option<(f64, &FistaResult)>,
    start: ArrayView1<f64>,
    config: &FistaConfig,
    warm_start: bool,
) -> Result<FistaResult, OptimizationError> {
    match previous {
        Some((previous_lambda, previous)) if warm_start => {
            continue_path(loss, lambda, lambda >= previous_lambda, previous, start, config)
        }
        _ => fista(loss, lambda, start, config),
    }
}

fn continue_path(
    loss: &DeconvolutionLoss<'_>,
    lambda: f64,
    ascending: bool,
    previous: &FistaResult,
    start: ArrayView1<f64>,
    config: &FistaConfig,
) -> Result<FistaResult, OptimizationError> {
    if !ascending {
        let seed = if previous.weights.is_all_zero() {
            start.reborrow()
        } else {
            previous.weights.as_view()
        };
        return fista(loss, lambda, seed, config);
    }
    if previous.weights.is_all_zero() {
        if !(lambda.is_finite() && lambda >= 0.0) {
            return Err(OptimizationError::InvalidLambda(lambda));
        }
        return Ok(FistaResult::all_zero(previous.weights.len(), config));
    }

    let seed = previous.weights.as_view();
    validate(loss, lambda, seed, config)?;
    let support = seed.iter().map(|&v| v != 0.0).collect::<Vec<_>>();
    Fista {
        loss,
        lambda,
        config,
        support: Some(support.as_slice()),
    }
    .run(seed)
}
