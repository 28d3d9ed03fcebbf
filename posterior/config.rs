//! Run configuration, read from a TOML file. Every field has a default so an empty
//! file (or no file at all) describes the standard course setup.
//!
//! ```toml
//! [model]
//! hyperparameters = [1.0, 1.0, 1.0, 1.0]
//!
//! [optimizer]
//! start = "least-squares"   # or "zero", or "explicit" with initial_theta
//! initial_theta = [0.0, 1.0, -1.0, -3.0]
//! tolerance = 1e-6
//! max_iterations = 500
//!
//! [sampling]
//! draws = 10000
//! seed = 12345
//! coverage = 0.9
//! ```

use crate::estimate::{ModeOptions, least_squares_start};
use crate::types::{Hyperparameter4, InferenceError, NUM_PARAMS, Observations, Parameter4};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] InferenceError),
}

/// How the mode search picks its starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartStrategy {
    Zero,
    LeastSquares,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub hyperparameters: [f64; NUM_PARAMS],
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            hyperparameters: [1.0; NUM_PARAMS],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSection {
    pub start: StartStrategy,
    /// Starting θ when `start = "explicit"`.
    pub initial_theta: Option<[f64; NUM_PARAMS]>,
    #[serde(flatten)]
    pub mode: ModeOptions,
}

impl OptimizerSection {
    pub fn starting_point(&self, observations: &Observations) -> Result<Parameter4, InferenceError> {
        match self.start {
            StartStrategy::Zero => Ok(Parameter4::zeros()),
            StartStrategy::LeastSquares => least_squares_start(observations),
            StartStrategy::Explicit => self.initial_theta.map(Parameter4::new).ok_or_else(|| {
                InferenceError::InvalidInput(
                    "optimizer.start = \"explicit\" requires optimizer.initial_theta".to_string(),
                )
            }),
        }
    }
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            start: StartStrategy::LeastSquares,
            initial_theta: None,
            mode: ModeOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingSection {
    pub draws: usize,
    pub seed: u64,
    pub coverage: f64,
}

impl Default for SamplingSection {
    fn default() -> Self {
        Self {
            draws: 10_000,
            seed: 12345,
            coverage: 0.9,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: ModelSection,
    pub optimizer: OptimizerSection,
    pub sampling: SamplingSection,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        log::info!("Loaded run configuration from '{}'", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn hyperparameters(&self) -> Result<Hyperparameter4, InferenceError> {
        Hyperparameter4::new(self.model.hyperparameters)
    }

    /// Checks the values a TOML file cannot constrain by type. Call again after
    /// overriding fields in code.
    pub fn validate(&self) -> Result<(), InferenceError> {
        self.hyperparameters()?;
        if self.optimizer.start == StartStrategy::Explicit && self.optimizer.initial_theta.is_none()
        {
            return Err(InferenceError::InvalidInput(
                "optimizer.start = \"explicit\" requires optimizer.initial_theta".to_string(),
            ));
        }
        if self.sampling.draws == 0 {
            return Err(InferenceError::InvalidInput(
                "sampling.draws must be positive".to_string(),
            ));
        }
        let coverage = self.sampling.coverage;
        if !(coverage > 0.0 && coverage < 1.0) {
            return Err(InferenceError::InvalidInput(format!(
                "sampling.coverage must lie strictly between 0 and 1, got {coverage}"
            )));
        }
        Ok(())
    }
}
