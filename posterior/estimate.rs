// posterior/estimate.rs

//! # Posterior Mode Search and Laplace Approximation
//!
//! The posterior mode is located in two stages:
//!
//! 1.  **BFGS:** `wolfe_bfgs` minimizes the negative log posterior from the
//!     caller's starting point using the analytic gradient.
//!
//! 2.  **Newton polish:** a handful of damped Newton steps with the analytic
//!     Hessian drive the gradient down to `gradient_tolerance`. The Laplace
//!     covariance is only as good as the mode it is evaluated at, and the line
//!     search in stage 1 tends to stall a few digits short of that.
//!
//! The negated Hessian at the polished mode must be positive-definite; its inverse
//! is the covariance of the Gaussian approximation.

// External Crate for Optimization
use wolfe_bfgs::{Bfgs, BfgsSolution};

use crate::model::{log_posterior_density, log_posterior_gradient, log_posterior_hessian};
use crate::types::{Hyperparameter4, InferenceError, NUM_PARAMS, Observations, Parameter4};

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::{Cholesky, InverseC, SolveC, UPLO};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Cost handed to BFGS when the posterior cannot be evaluated at a trial point.
const NON_FINITE_COST: f64 = 1e10;
/// Step halvings tried by the Newton polish before it gives up on a direction.
const MAX_STEP_HALVINGS: usize = 40;
/// Floor on the residual variance used to seed the variance coefficients.
const MIN_SEED_VARIANCE: f64 = 1e-8;

/// Tuning knobs for the mode search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeOptions {
    /// Convergence tolerance handed to BFGS.
    pub tolerance: f64,
    /// Iteration cap for BFGS.
    pub max_iterations: usize,
    /// Maximum number of Newton polish steps.
    pub newton_steps: usize,
    /// Max-norm of the gradient below which the mode is accepted.
    pub gradient_tolerance: f64,
}

impl Default for ModeOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 500,
            newton_steps: 50,
            gradient_tolerance: 1e-5,
        }
    }
}

/// Gaussian approximation N(mean, covariance) to the posterior over θ.
#[derive(Debug, Clone, Serialize)]
pub struct LaplaceApproximation {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
    pub log_posterior_at_mode: f64,
    /// BFGS iterations plus Newton polish steps spent reaching the mode.
    pub iterations: usize,
}

impl LaplaceApproximation {
    pub fn mode(&self) -> Parameter4 {
        Parameter4::new([self.mean[0], self.mean[1], self.mean[2], self.mean[3]])
    }

    pub fn standard_errors(&self) -> Array1<f64> {
        self.covariance.diag().mapv(f64::sqrt)
    }
}

/// Finds the posterior mode starting from `theta0` and returns the Laplace
/// approximation there.
pub fn find_mode(
    theta0: &Parameter4,
    observations: &Observations,
    gamma: &Hyperparameter4,
    options: &ModeOptions,
) -> Result<LaplaceApproximation, InferenceError> {
    if !theta0.is_finite() {
        return Err(InferenceError::InvalidInput(format!(
            "starting point must be finite, got {:?}",
            theta0.0
        )));
    }
    log::info!(
        "Starting posterior mode search from {:?} with {} observations.",
        theta0.0,
        observations.len()
    );

    let initial_value = log_posterior_density(theta0, observations.x(), observations.y(), gamma)?;
    if !initial_value.is_finite() {
        return Err(InferenceError::FailedApproximation(format!(
            "log posterior is not finite at the starting point: {initial_value}"
        )));
    }
    log::debug!("Initial log posterior: {:.6}", initial_value);

    // The objective records the best finite point it has seen so a stalled line
    // search still leaves us somewhere to polish from.
    let best: Rc<RefCell<Option<(f64, Array1<f64>)>>> = Rc::new(RefCell::new(None));
    let tracker = Rc::clone(&best);
    let x = observations.x().to_owned();
    let y = observations.y().to_owned();
    let gamma_for_closure = *gamma;

    let cost_and_grad = move |point: &Array1<f64>| -> (f64, Array1<f64>) {
        let theta = Parameter4::new([point[0], point[1], point[2], point[3]]);
        let value = log_posterior_density(&theta, x.view(), y.view(), &gamma_for_closure);
        let grad = log_posterior_gradient(&theta, x.view(), y.view(), &gamma_for_closure);
        match (value, grad) {
            (Ok(value), Ok(grad)) if value.is_finite() && grad.iter().all(|g| g.is_finite()) => {
                let cost = -value;
                let mut slot = tracker.borrow_mut();
                if slot.as_ref().is_none_or(|(best_cost, _)| cost < *best_cost) {
                    *slot = Some((cost, point.clone()));
                }
                (cost, -grad)
            }
            _ => {
                log::warn!(
                    "Non-finite log posterior at {:?}, returning large finite cost",
                    point.to_vec()
                );
                (NON_FINITE_COST, Array1::zeros(NUM_PARAMS))
            }
        }
    };

    let (bfgs_point, bfgs_iterations) = match Bfgs::new(theta0.to_array(), cost_and_grad)
        .with_tolerance(options.tolerance)
        .with_max_iterations(options.max_iterations)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => {
            log::info!(
                "BFGS completed in {} iterations with negative log posterior {:.6}",
                iterations,
                final_value
            );
            (final_point, iterations)
        }
        Err(e) => {
            log::warn!("BFGS stopped early: {:?}. Polishing from the best point seen.", e);
            let recovered = best.borrow().as_ref().map(|(_, point)| point.clone());
            match recovered {
                Some(point) => (point, options.max_iterations),
                None => {
                    return Err(InferenceError::FailedApproximation(format!(
                        "BFGS failed without evaluating a finite posterior: {e:?}"
                    )));
                }
            }
        }
    };

    let start = Parameter4::from_view(bfgs_point.view())?;
    let (mode, newton_steps) = newton_polish(start, observations, gamma, options)?;
    log::info!(
        "Newton polish finished after {} steps at {:?}",
        newton_steps,
        mode.0
    );

    let mut approximation = laplace_at(&mode, observations, gamma)?;
    approximation.iterations = bfgs_iterations + newton_steps;
    Ok(approximation)
}

/// Builds the Laplace approximation at `theta` without searching. Fails with
/// `FailedApproximation` when the log posterior is not strictly concave there.
pub fn laplace_at(
    theta: &Parameter4,
    observations: &Observations,
    gamma: &Hyperparameter4,
) -> Result<LaplaceApproximation, InferenceError> {
    let log_posterior_at_mode =
        log_posterior_density(theta, observations.x(), observations.y(), gamma)?;
    let hessian = log_posterior_hessian(theta, observations.x(), observations.y(), gamma)?;
    let neg_hessian = -hessian;

    if neg_hessian.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::FailedApproximation(format!(
            "Hessian is not finite at {:?}",
            theta.0
        )));
    }

    neg_hessian.cholesky(UPLO::Lower).map_err(|e| {
        InferenceError::FailedApproximation(format!(
            "Hessian is not negative-definite at {:?}: {e}",
            theta.0
        ))
    })?;

    let inverse = neg_hessian.invc().map_err(|e| {
        InferenceError::FailedApproximation(format!("Hessian could not be inverted: {e}"))
    })?;
    let covariance = (&inverse + &inverse.t()) * 0.5;

    if covariance.iter().any(|v| !v.is_finite()) || covariance.diag().iter().any(|&v| v <= 0.0) {
        return Err(InferenceError::FailedApproximation(
            "approximate posterior covariance is degenerate".to_string(),
        ));
    }

    Ok(LaplaceApproximation {
        mean: theta.to_array(),
        covariance,
        log_posterior_at_mode,
        iterations: 0,
    })
}

/// Ordinary least squares for the location coefficients and an even split of the
/// residual variance between the constant and quadratic variance terms.
pub fn least_squares_start(observations: &Observations) -> Result<Parameter4, InferenceError> {
    let x = observations.x();
    let y = observations.y();
    let n = x.len();
    if n < 2 {
        return Err(InferenceError::InvalidInput(format!(
            "least squares start needs at least 2 observations, got {n}"
        )));
    }

    let nf = n as f64;
    let x_mean = x.sum() / nf;
    let y_mean = y.sum() / nf;
    let sxx = x.iter().map(|&xi| (xi - x_mean).powi(2)).sum::<f64>();
    if sxx <= 0.0 {
        return Err(InferenceError::InvalidInput(
            "least squares start needs at least two distinct x values".to_string(),
        ));
    }
    let sxy = x
        .iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| (xi - x_mean) * (yi - y_mean))
        .sum::<f64>();
    let slope = sxy / sxx;
    let intercept = y_mean - slope * x_mean;

    let rss = residual_sum_of_squares(x, y, intercept, slope);
    let dof = if n > 2 { nf - 2.0 } else { nf };
    let sigma2 = (rss / dof).max(MIN_SEED_VARIANCE);
    let mean_x2 = (x.iter().map(|&xi| xi * xi).sum::<f64>() / nf).max(MIN_SEED_VARIANCE);

    let start = Parameter4::new([
        intercept,
        slope,
        (0.5 * sigma2).ln(),
        (0.5 * sigma2 / mean_x2).ln(),
    ]);
    log::debug!("Least squares starting point: {:?}", start.0);
    Ok(start)
}

fn residual_sum_of_squares(
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    intercept: f64,
    slope: f64,
) -> f64 {
    x.iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| (yi - intercept - slope * xi).powi(2))
        .sum()
}

/// Damped Newton ascent on the log posterior. Returns the polished point and the
/// number of steps taken, or `FailedApproximation` if the gradient never gets
/// below `options.gradient_tolerance`.
fn newton_polish(
    start: Parameter4,
    observations: &Observations,
    gamma: &Hyperparameter4,
    options: &ModeOptions,
) -> Result<(Parameter4, usize), InferenceError> {
    let (x, y) = (observations.x(), observations.y());
    let mut theta = start;
    let mut value = log_posterior_density(&theta, x, y, gamma)?;
    let mut steps = 0;

    while steps < options.newton_steps {
        let grad = log_posterior_gradient(&theta, x, y, gamma)?;
        if max_abs(&grad) <= options.gradient_tolerance {
            break;
        }
        let neg_hessian = -log_posterior_hessian(&theta, x, y, gamma)?;
        let direction = damped_newton_direction(&neg_hessian, &grad)?;

        let mut scale = 1.0;
        let mut accepted = false;
        for _ in 0..MAX_STEP_HALVINGS {
            let candidate = Parameter4::new([
                theta[0] + scale * direction[0],
                theta[1] + scale * direction[1],
                theta[2] + scale * direction[2],
                theta[3] + scale * direction[3],
            ]);
            let candidate_value = log_posterior_density(&candidate, x, y, gamma)?;
            if candidate_value.is_finite() && candidate_value >= value {
                theta = candidate;
                value = candidate_value;
                accepted = true;
                break;
            }
            scale *= 0.5;
        }
        steps += 1;
        if !accepted {
            log::debug!("Newton polish could not improve the posterior; stopping.");
            break;
        }
    }

    let grad_norm = max_abs(&log_posterior_gradient(&theta, x, y, gamma)?);
    if !(grad_norm <= options.gradient_tolerance) {
        return Err(InferenceError::FailedApproximation(format!(
            "mode search did not converge: gradient max-norm {grad_norm:.3e} exceeds {:.1e}",
            options.gradient_tolerance
        )));
    }
    Ok((theta, steps))
}

/// Solves `(A + λI) d = g` for the smallest λ in a geometric ladder that makes the
/// shifted matrix positive-definite.
fn damped_newton_direction(
    neg_hessian: &Array2<f64>,
    grad: &Array1<f64>,
) -> Result<Array1<f64>, InferenceError> {
    let scale = neg_hessian
        .diag()
        .iter()
        .fold(1.0_f64, |acc, &v| acc.max(v.abs()));
    let mut lambda = 0.0;
    for _ in 0..20 {
        let mut shifted = neg_hessian.clone();
        shifted.diag_mut().mapv_inplace(|v| v + lambda);
        if let Ok(direction) = shifted.solvec(grad) {
            if direction.iter().all(|d| d.is_finite()) {
                return Ok(direction);
            }
        }
        lambda = if lambda == 0.0 { 1e-8 * scale } else { lambda * 10.0 };
    }
    Err(InferenceError::FailedApproximation(
        "could not find a positive-definite Newton system".to_string(),
    ))
}

fn max_abs(values: &Array1<f64>) -> f64 {
    values.iter().fold(0.0_f64, |acc, &v| acc.max(v.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn toy_observations() -> Observations {
        Observations::new(
            array![1.0, 2.0, 3.0, 4.0, 5.0],
            array![1.1, 2.0, 2.9, 4.2, 4.8],
        )
        .unwrap()
    }

    fn unit_gamma() -> Hyperparameter4 {
        Hyperparameter4::new([1.0, 1.0, 1.0, 1.0]).unwrap()
    }

    #[test]
    fn mode_from_zero_recovers_near_identity_fit() {
        let obs = toy_observations();
        let fit = find_mode(&Parameter4::zeros(), &obs, &unit_gamma(), &ModeOptions::default())
            .unwrap();
        assert!(fit.mean.iter().all(|v| v.is_finite()));
        assert!((fit.mean[0] - 0.0).abs() < 0.5, "theta1 = {}", fit.mean[0]);
        assert!((fit.mean[1] - 1.0).abs() < 0.5, "theta2 = {}", fit.mean[1]);
        // Reference mode from an independent Newton iteration.
        assert_relative_eq!(fit.mean[0], 0.110_417_4, epsilon = 1e-4);
        assert_relative_eq!(fit.mean[1], 0.962_881_1, epsilon = 1e-4);
        assert_relative_eq!(fit.mean[2], -3.826_333, epsilon = 1e-3);
        assert_relative_eq!(fit.mean[3], -5.563_456, epsilon = 1e-3);
    }

    #[test]
    fn covariance_is_symmetric_positive_definite() {
        let obs = toy_observations();
        let fit = find_mode(&Parameter4::zeros(), &obs, &unit_gamma(), &ModeOptions::default())
            .unwrap();
        let s = &fit.covariance;
        assert_eq!(s.dim(), (4, 4));
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(s[[i, j]], s[[j, i]]);
            }
        }
        assert!(s.cholesky(UPLO::Lower).is_ok());
        assert_relative_eq!(s[[1, 1]], 0.005_595_8, epsilon = 1e-5);
        assert_relative_eq!(s[[0, 1]], -0.012_604_5, epsilon = 1e-5);
        assert!(fit.standard_errors().iter().all(|&se| se > 0.0));
    }

    #[test]
    fn least_squares_start_reaches_the_same_mode() {
        let obs = toy_observations();
        let gamma = unit_gamma();
        let start = least_squares_start(&obs).unwrap();
        assert_relative_eq!(start[1], 0.96, epsilon = 1e-9);
        let from_ols = find_mode(&start, &obs, &gamma, &ModeOptions::default()).unwrap();
        let from_zero =
            find_mode(&Parameter4::zeros(), &obs, &gamma, &ModeOptions::default()).unwrap();
        for i in 0..4 {
            assert_relative_eq!(from_ols.mean[i], from_zero.mean[i], epsilon = 1e-5);
        }
    }

    #[test]
    fn gradient_vanishes_at_reported_mode() {
        let obs = toy_observations();
        let gamma = unit_gamma();
        let fit = find_mode(&Parameter4::zeros(), &obs, &gamma, &ModeOptions::default()).unwrap();
        let grad = log_posterior_gradient(&fit.mode(), obs.x(), obs.y(), &gamma).unwrap();
        assert!(max_abs(&grad) <= 1e-5, "gradient {grad:?}");
    }

    #[test]
    fn non_concave_point_is_a_failed_approximation() {
        // One large residual with a unit constant variance and a vanishing quadratic
        // term: the (θ1, θ3) block of the negated Hessian has a negative determinant.
        let obs = Observations::new(array![1.0], array![10.0]).unwrap();
        let theta = Parameter4::new([0.0, 1.0, 0.0, -20.0]);
        let err = laplace_at(&theta, &obs, &unit_gamma()).unwrap_err();
        assert!(matches!(err, InferenceError::FailedApproximation(_)), "{err:?}");
    }

    #[test]
    fn exhausted_budget_is_reported_not_accepted() {
        let obs = toy_observations();
        let options = ModeOptions {
            max_iterations: 1,
            newton_steps: 0,
            ..ModeOptions::default()
        };
        let err = find_mode(&Parameter4::zeros(), &obs, &unit_gamma(), &options).unwrap_err();
        assert!(matches!(err, InferenceError::FailedApproximation(_)), "{err:?}");
    }

    #[test]
    fn least_squares_start_needs_spread_in_x() {
        let obs = Observations::new(array![2.0, 2.0, 2.0], array![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            least_squares_start(&obs),
            Err(InferenceError::InvalidInput(_))
        ));
    }

    #[test]
    fn non_finite_start_is_invalid_input() {
        let obs = toy_observations();
        let start = Parameter4::new([f64::NAN, 0.0, 0.0, 0.0]);
        assert!(matches!(
            find_mode(&start, &obs, &unit_gamma(), &ModeOptions::default()),
            Err(InferenceError::InvalidInput(_))
        ));
    }
}
