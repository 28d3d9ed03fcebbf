//! Conversions between the unconstrained parameter vector θ and the natural-scale
//! coefficients β. The variance coefficients live on the log scale in θ so the
//! optimizer and the Gaussian proposal can roam all of ℝ⁴.

use crate::types::{Coefficients4, InferenceError, Parameter4};

/// β1 = θ1, β2 = θ2, β3 = exp(θ3), β4 = exp(θ4).
#[inline]
pub fn theta_to_beta(theta: &Parameter4) -> Coefficients4 {
    Coefficients4 {
        beta1: theta[0],
        beta2: theta[1],
        beta3: theta[2].exp(),
        beta4: theta[3].exp(),
    }
}

/// Inverse of [`theta_to_beta`]. Fails when a variance coefficient is not positive.
pub fn beta_to_theta(beta: &Coefficients4) -> Result<Parameter4, InferenceError> {
    if !(beta.beta3 > 0.0 && beta.beta4 > 0.0) {
        return Err(InferenceError::InvalidInput(format!(
            "variance coefficients must be positive, got beta3={} beta4={}",
            beta.beta3, beta.beta4
        )));
    }
    Ok(Parameter4::new([
        beta.beta1,
        beta.beta2,
        beta.beta3.ln(),
        beta.beta4.ln(),
    ]))
}
