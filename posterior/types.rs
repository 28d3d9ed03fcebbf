use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use thiserror::Error;

/// Number of model parameters: intercept, slope, and the two variance coefficients.
pub const NUM_PARAMS: usize = 4;

/// The two failure kinds of the inference core. Both are reported synchronously;
/// recovery (e.g. restarting the mode search elsewhere) is left to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Posterior approximation failed: {0}")]
    FailedApproximation(String),
}

/// One (CAD weight, actual weight) pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub x: f64,
    pub y: f64,
}

/// An immutable, validated set of observations with equal-length `x` and `y`.
#[derive(Clone, Debug, PartialEq)]
pub struct Observations {
    x: Array1<f64>,
    y: Array1<f64>,
}

impl Observations {
    pub fn new(x: Array1<f64>, y: Array1<f64>) -> Result<Self, InferenceError> {
        if x.len() != y.len() {
            return Err(InferenceError::InvalidInput(format!(
                "x has {} values but y has {}",
                x.len(),
                y.len()
            )));
        }
        Ok(Self { x, y })
    }

    pub fn from_pairs(pairs: &[Observation]) -> Self {
        Self {
            x: pairs.iter().map(|o| o.x).collect(),
            y: pairs.iter().map(|o| o.y).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self) -> ArrayView1<'_, f64> {
        self.x.view()
    }

    pub fn y(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    pub fn iter(&self) -> impl Iterator<Item = Observation> + '_ {
        self.x
            .iter()
            .zip(self.y.iter())
            .map(|(&x, &y)| Observation { x, y })
    }
}

/// The unconstrained parameter vector θ = (β1, β2, log β3, log β4).
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter4(pub [f64; NUM_PARAMS]);

impl Parameter4 {
    pub fn new(values: [f64; NUM_PARAMS]) -> Self {
        Self(values)
    }

    pub fn zeros() -> Self {
        Self([0.0; NUM_PARAMS])
    }

    pub fn from_view(values: ArrayView1<'_, f64>) -> Result<Self, InferenceError> {
        if values.len() != NUM_PARAMS {
            return Err(InferenceError::InvalidInput(format!(
                "parameter vector must have {NUM_PARAMS} entries, got {}",
                values.len()
            )));
        }
        Ok(Self([values[0], values[1], values[2], values[3]]))
    }

    pub fn to_array(&self) -> Array1<f64> {
        Array1::from(self.0.to_vec())
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl Deref for Parameter4 {
    type Target = [f64; NUM_PARAMS];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[f64; NUM_PARAMS]> for Parameter4 {
    fn from(values: [f64; NUM_PARAMS]) -> Self {
        Self(values)
    }
}

/// Regression coefficients on their natural scale; `beta3` and `beta4` are positive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coefficients4 {
    pub beta1: f64,
    pub beta2: f64,
    pub beta3: f64,
    pub beta4: f64,
}

impl Coefficients4 {
    pub fn to_array(&self) -> [f64; NUM_PARAMS] {
        [self.beta1, self.beta2, self.beta3, self.beta4]
    }

    /// Coefficient `index` (0 = β1 ... 3 = β4), or `None` past β4.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.to_array().get(index).copied()
    }
}

/// Prior hyperparameters γ: variances of the two normal priors and rates of the
/// two log-exponential priors. Always strictly positive.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Hyperparameter4([f64; NUM_PARAMS]);

impl Hyperparameter4 {
    pub fn new(values: [f64; NUM_PARAMS]) -> Result<Self, InferenceError> {
        if let Some((i, v)) = values
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v <= 0.0)
        {
            return Err(InferenceError::InvalidInput(format!(
                "hyperparameter gamma{} must be a positive finite number, got {v}",
                i + 1
            )));
        }
        Ok(Self(values))
    }
}

impl Deref for Hyperparameter4 {
    type Target = [f64; NUM_PARAMS];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A single importance draw on the coefficient scale with its normalized log weight.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedSample {
    pub beta: Coefficients4,
    pub log_weight: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredibleInterval {
    pub lower: f64,
    pub upper: f64,
    pub coverage: f64,
}

impl CredibleInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}
