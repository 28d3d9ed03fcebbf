//! Self-normalized importance sampling with the Laplace approximation as proposal.
//!
//! Draws are generated sequentially from the caller's generator so a given seed
//! always yields the same sample, whatever the size of the rayon pool. Only the
//! posterior evaluations, which dominate the cost, run in parallel.

use crate::estimate::LaplaceApproximation;
use crate::interval::make_credible_interval;
use crate::model::log_posterior_density;
use crate::transform::theta_to_beta;
use crate::types::{
    CredibleInterval, Hyperparameter4, InferenceError, NUM_PARAMS, Observations, Parameter4,
    WeightedSample,
};
use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, UPLO};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::f64::consts::PI;

/// Numerically stable `log(Σ exp(v))` using the max-shift identity.
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let shifted_sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + shifted_sum.ln()
}

/// The weighted draws produced by [`do_importance`], in draw order.
#[derive(Debug, Clone)]
pub struct ImportanceSample {
    samples: Vec<WeightedSample>,
}

impl ImportanceSample {
    pub fn samples(&self) -> &[WeightedSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<WeightedSample> {
        self.samples
    }

    /// Values of coefficient `index` (0 = β1 ... 3 = β4) across all draws, or
    /// `None` for an index past β4.
    pub fn column(&self, index: usize) -> Option<Array1<f64>> {
        if index >= NUM_PARAMS {
            return None;
        }
        Some(self.values_of(index))
    }

    fn columns(&self) -> [Array1<f64>; NUM_PARAMS] {
        std::array::from_fn(|i| self.values_of(i))
    }

    // Callers guarantee `index < NUM_PARAMS`.
    fn values_of(&self, index: usize) -> Array1<f64> {
        self.samples.iter().map(|s| s.beta.to_array()[index]).collect()
    }

    /// Linear-scale normalized weights.
    pub fn weights(&self) -> Array1<f64> {
        self.samples.iter().map(|s| s.log_weight.exp()).collect()
    }

    /// Kish effective sample size, 1 / Σ w².
    pub fn effective_sample_size(&self) -> f64 {
        let w = self.weights();
        let total = w.sum();
        total * total / w.dot(&w)
    }

    /// Posterior means of β1..β4 under the importance weights.
    pub fn weighted_means(&self) -> [f64; NUM_PARAMS] {
        let w = self.weights();
        self.columns().map(|column| column.dot(&w))
    }

    /// Credible intervals for β1..β4 at the requested coverage.
    pub fn credible_intervals(
        &self,
        coverage: f64,
    ) -> Result<[CredibleInterval; NUM_PARAMS], InferenceError> {
        let w = self.weights();
        let weights = w.as_slice().ok_or_else(|| {
            InferenceError::InvalidInput("weights are not contiguous".to_string())
        })?;
        let mut intervals = Vec::with_capacity(NUM_PARAMS);
        for values in self.columns() {
            intervals.push(make_credible_interval(&values.to_vec(), weights, coverage)?);
        }
        Ok([intervals[0], intervals[1], intervals[2], intervals[3]])
    }
}

/// Draws `n` samples from the Laplace approximation and reweights them toward the
/// true posterior. Normalized log weights satisfy `Σ exp(w) = 1`.
pub fn do_importance<R: Rng + ?Sized>(
    n: usize,
    approximation: &LaplaceApproximation,
    observations: &Observations,
    gamma: &Hyperparameter4,
    rng: &mut R,
) -> Result<ImportanceSample, InferenceError> {
    if n == 0 {
        return Err(InferenceError::InvalidInput(
            "number of importance draws must be positive".to_string(),
        ));
    }
    let mu = &approximation.mean;
    let cov = &approximation.covariance;
    if mu.len() != NUM_PARAMS || cov.dim() != (NUM_PARAMS, NUM_PARAMS) {
        return Err(InferenceError::InvalidInput(format!(
            "proposal must be {NUM_PARAMS}-dimensional, got mean {} and covariance {:?}",
            mu.len(),
            cov.dim()
        )));
    }
    if mu.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::InvalidInput(
            "proposal mean is not finite".to_string(),
        ));
    }
    let lower: Array2<f64> = cov.cholesky(UPLO::Lower).map_err(|e| {
        InferenceError::InvalidInput(format!("proposal covariance is not positive-definite: {e}"))
    })?;

    // log N(θ; μ, S) with θ = μ + Lz reduces to a function of z alone.
    let log_norm_const = -0.5 * NUM_PARAMS as f64 * (2.0 * PI).ln()
        - lower.diag().iter().map(|d| d.ln()).sum::<f64>();

    log::info!("Drawing {} importance samples from the Laplace proposal.", n);
    let mut draws: Vec<(Parameter4, f64)> = Vec::with_capacity(n);
    for _ in 0..n {
        let z: Array1<f64> = (0..NUM_PARAMS).map(|_| rng.sample(StandardNormal)).collect();
        let theta = mu + &lower.dot(&z);
        let log_proposal = log_norm_const - 0.5 * z.dot(&z);
        draws.push((Parameter4::from_view(theta.view())?, log_proposal));
    }

    let raw_log_weights: Vec<f64> = draws
        .par_iter()
        .map(|(theta, log_proposal)| {
            log_posterior_density(theta, observations.x(), observations.y(), gamma)
                .map(|log_target| log_target - log_proposal)
        })
        .collect::<Result<_, _>>()?;

    let log_normalizer = log_sum_exp(&raw_log_weights);
    if !log_normalizer.is_finite() {
        return Err(InferenceError::FailedApproximation(format!(
            "importance weights could not be normalized (log normalizer {log_normalizer})"
        )));
    }

    let samples: Vec<WeightedSample> = draws
        .iter()
        .zip(raw_log_weights.iter())
        .map(|((theta, _), &raw)| WeightedSample {
            beta: theta_to_beta(theta),
            log_weight: raw - log_normalizer,
        })
        .collect();

    let sample = ImportanceSample { samples };
    log::info!(
        "Importance sampling done: effective sample size {:.1} of {}",
        sample.effective_sample_size(),
        n
    );
    Ok(sample)
}
