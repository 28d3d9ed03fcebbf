//! Weighted quantiles and equal-tailed credible intervals.
//!
//! The quantile rule is a weighted form of Hyndman & Fan type 7 (the default
//! sample quantile in most statistics packages). Values with zero weight are
//! dropped. Each remaining sorted value `x₍ᵢ₎` is anchored at the midpoint of its
//! cumulative-weight cell, `mᵢ = Cᵢ₋₁ + wᵢ/2`, and the anchors are rescaled so the
//! outermost ones sit at 0 and 1:
//!
//! ```text
//! pᵢ = (mᵢ - m₁) / (mₙ - m₁),   Q(p) = linear interpolation of (pᵢ, x₍ᵢ₎)
//! ```
//!
//! For equal weights `mᵢ = (i - ½)/n`, so `pᵢ = (i - 1)/(n - 1)`: exactly the type 7
//! plotting positions. Because every kept weight is positive the anchors strictly
//! increase, so on tie-free data `Q` is strictly increasing in `p` and intervals of
//! larger coverage strictly contain those of smaller coverage.

use crate::types::{CredibleInterval, InferenceError};

/// Tolerance on `Σ weights = 1`.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Equal-tailed interval holding `coverage` of the weighted mass.
pub fn make_credible_interval(
    values: &[f64],
    weights: &[f64],
    coverage: f64,
) -> Result<CredibleInterval, InferenceError> {
    if !(coverage > 0.0 && coverage < 1.0) {
        return Err(InferenceError::InvalidInput(format!(
            "coverage must lie strictly between 0 and 1, got {coverage}"
        )));
    }
    let tail = (1.0 - coverage) / 2.0;
    let sorted = validated_sorted_pairs(values, weights)?;
    Ok(CredibleInterval {
        lower: quantile_of_sorted(&sorted, tail),
        upper: quantile_of_sorted(&sorted, 1.0 - tail),
        coverage,
    })
}

/// Weighted type 7 quantile at probability `p ∈ [0, 1]`.
pub fn weighted_quantile(values: &[f64], weights: &[f64], p: f64) -> Result<f64, InferenceError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(InferenceError::InvalidInput(format!(
            "quantile probability must lie in [0, 1], got {p}"
        )));
    }
    let sorted = validated_sorted_pairs(values, weights)?;
    Ok(quantile_of_sorted(&sorted, p))
}

/// Checks the inputs and returns `(value, weight)` pairs sorted by value with the
/// weights rescaled to sum to exactly one.
fn validated_sorted_pairs(
    values: &[f64],
    weights: &[f64],
) -> Result<Vec<(f64, f64)>, InferenceError> {
    if values.is_empty() {
        return Err(InferenceError::InvalidInput(
            "cannot summarize an empty sample".to_string(),
        ));
    }
    if values.len() != weights.len() {
        return Err(InferenceError::InvalidInput(format!(
            "{} values but {} weights",
            values.len(),
            weights.len()
        )));
    }
    if let Some(i) = values.iter().position(|v| !v.is_finite()) {
        return Err(InferenceError::InvalidInput(format!(
            "value at position {i} is not finite"
        )));
    }
    if let Some(i) = weights.iter().position(|w| !w.is_finite() || *w < 0.0) {
        return Err(InferenceError::InvalidInput(format!(
            "weight at position {i} is negative or not finite: {}",
            weights[i]
        )));
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(InferenceError::InvalidInput(format!(
            "weights must sum to 1, got {total}"
        )));
    }

    let mut pairs: Vec<(f64, f64)> = values
        .iter()
        .zip(weights.iter())
        .map(|(&v, &w)| (v, w / total))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(pairs)
}

fn quantile_of_sorted(sorted: &[(f64, f64)], p: f64) -> f64 {
    let mut anchors: Vec<(f64, f64)> = Vec::with_capacity(sorted.len());
    let mut cumulative = 0.0;
    for &(value, weight) in sorted {
        if weight > 0.0 {
            anchors.push((cumulative + 0.5 * weight, value));
            cumulative += weight;
        }
    }

    // The weights sum to one, so at least one anchor exists.
    let (first, last) = match (anchors.first(), anchors.last()) {
        (Some(&(first, _)), Some(&(last, _))) if last > first => (first, last),
        (Some(&(_, value)), _) => return value,
        _ => return f64::NAN,
    };
    let target = first + p * (last - first);

    let upper = anchors.partition_point(|&(position, _)| position < target);
    if upper == 0 {
        return anchors[0].1;
    }
    if upper == anchors.len() {
        return anchors[anchors.len() - 1].1;
    }
    let (lo_pos, lo_val) = anchors[upper - 1];
    let (hi_pos, hi_val) = anchors[upper];
    let fraction = (target - lo_pos) / (hi_pos - lo_pos);
    lo_val + fraction * (hi_val - lo_val)
}
