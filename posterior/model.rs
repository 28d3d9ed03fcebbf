//! # Observation Model and Posterior Density
//!
//! Heteroscedastic Gaussian regression of actual weight on CAD weight:
//!
//! ```text
//! y_i ~ N(β1 + β2·x_i, β3 + β4·x_i²)
//! ```
//!
//! with priors on θ = (β1, β2, log β3, log β4):
//!
//! - θ1 ~ N(0, γ1), θ2 ~ N(1, γ2) (second argument is a variance)
//! - θ3, θ4 are logarithms of Exponential(γ3), Exponential(γ4) variables
//!
//! Everything here is unnormalized: the evidence is never computed. The analytic
//! gradient and Hessian are exact derivatives of `log_posterior_density` and drive
//! the mode search in `estimate`.

use crate::transform::theta_to_beta;
use crate::types::{Hyperparameter4, InferenceError, NUM_PARAMS, Parameter4};
use ndarray::{Array1, Array2, ArrayView1, Zip};
use std::f64::consts::PI;

/// log N(value; mean, variance).
#[inline]
pub fn normal_log_density(value: f64, mean: f64, variance: f64) -> f64 {
    let resid = value - mean;
    -0.5 * (2.0 * PI * variance).ln() - resid * resid / (2.0 * variance)
}

/// Log-density of log(E) where E ~ Exponential(rate):
/// `log(rate) + value - rate * exp(value)`.
#[inline]
pub fn log_exponential_log_density(value: f64, rate: f64) -> f64 {
    rate.ln() + value - rate * value.exp()
}

pub fn log_prior_density(theta: &Parameter4, gamma: &Hyperparameter4) -> f64 {
    normal_log_density(theta[0], 0.0, gamma[0])
        + normal_log_density(theta[1], 1.0, gamma[1])
        + log_exponential_log_density(theta[2], gamma[2])
        + log_exponential_log_density(theta[3], gamma[3])
}

pub fn log_likelihood(
    theta: &Parameter4,
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
) -> Result<f64, InferenceError> {
    check_lengths(x, y)?;
    let beta = theta_to_beta(theta);
    let mut total = 0.0;
    Zip::from(&x).and(&y).for_each(|&xi, &yi| {
        let variance = beta.beta3 + beta.beta4 * xi * xi;
        total += normal_log_density(yi, beta.beta1 + beta.beta2 * xi, variance);
    });
    Ok(total)
}

pub fn log_posterior_density(
    theta: &Parameter4,
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    gamma: &Hyperparameter4,
) -> Result<f64, InferenceError> {
    Ok(log_likelihood(theta, x, y)? + log_prior_density(theta, gamma))
}

/// Gradient of `log_posterior_density` with respect to θ.
pub fn log_posterior_gradient(
    theta: &Parameter4,
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    gamma: &Hyperparameter4,
) -> Result<Array1<f64>, InferenceError> {
    check_lengths(x, y)?;
    let beta = theta_to_beta(theta);
    let mut grad = Array1::<f64>::zeros(NUM_PARAMS);

    Zip::from(&x).and(&y).for_each(|&xi, &yi| {
        let x2 = xi * xi;
        let v = beta.beta3 + beta.beta4 * x2;
        let r = yi - beta.beta1 - beta.beta2 * xi;
        // d loglik / d v
        let dv = (r * r - v) / (2.0 * v * v);
        grad[0] += r / v;
        grad[1] += r * xi / v;
        grad[2] += dv * beta.beta3;
        grad[3] += dv * beta.beta4 * x2;
    });

    grad[0] -= theta[0] / gamma[0];
    grad[1] -= (theta[1] - 1.0) / gamma[1];
    grad[2] += 1.0 - gamma[2] * beta.beta3;
    grad[3] += 1.0 - gamma[3] * beta.beta4;
    Ok(grad)
}

/// Hessian of `log_posterior_density` with respect to θ. Symmetric by construction.
pub fn log_posterior_hessian(
    theta: &Parameter4,
    x: ArrayView1<'_, f64>,
    y: ArrayView1<'_, f64>,
    gamma: &Hyperparameter4,
) -> Result<Array2<f64>, InferenceError> {
    check_lengths(x, y)?;
    let beta = theta_to_beta(theta);
    let mut h = Array2::<f64>::zeros((NUM_PARAMS, NUM_PARAMS));

    Zip::from(&x).and(&y).for_each(|&xi, &yi| {
        let x2 = xi * xi;
        let v = beta.beta3 + beta.beta4 * x2;
        let r = yi - beta.beta1 - beta.beta2 * xi;
        let v2 = v * v;
        let dv = (r * r - v) / (2.0 * v2);
        let d2v = (v - 2.0 * r * r) / (2.0 * v2 * v);
        // dv/dθ3 and dv/dθ4
        let s3 = beta.beta3;
        let s4 = beta.beta4 * x2;

        h[[0, 0]] -= 1.0 / v;
        h[[0, 1]] -= xi / v;
        h[[1, 1]] -= x2 / v;
        h[[0, 2]] -= r * s3 / v2;
        h[[0, 3]] -= r * s4 / v2;
        h[[1, 2]] -= r * xi * s3 / v2;
        h[[1, 3]] -= r * xi * s4 / v2;
        h[[2, 2]] += d2v * s3 * s3 + dv * s3;
        h[[2, 3]] += d2v * s3 * s4;
        h[[3, 3]] += d2v * s4 * s4 + dv * s4;
    });

    h[[0, 0]] -= 1.0 / gamma[0];
    h[[1, 1]] -= 1.0 / gamma[1];
    h[[2, 2]] -= gamma[2] * beta.beta3;
    h[[3, 3]] -= gamma[3] * beta.beta4;

    for i in 0..NUM_PARAMS {
        for j in 0..i {
            h[[i, j]] = h[[j, i]];
        }
    }
    Ok(h)
}

fn check_lengths(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> Result<(), InferenceError> {
    if x.len() != y.len() {
        return Err(InferenceError::InvalidInput(format!(
            "x has {} values but y has {}",
            x.len(),
            y.len()
        )));
    }
    Ok(())
}
