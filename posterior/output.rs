//! Result files: the weighted draws as a TSV table and human-readable TOML
//! summaries of the Laplace fit and of the importance-sampled posterior.

use crate::estimate::LaplaceApproximation;
use crate::importance::ImportanceSample;
use crate::transform::theta_to_beta;
use crate::types::{Coefficients4, CredibleInterval, InferenceError, NUM_PARAMS};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const SAMPLE_HEADER: [&str; 5] = ["beta1", "beta2", "beta3", "beta4", "log_weight"];

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write delimited output: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Cannot summarize posterior: {0}")]
    Summary(#[from] InferenceError),
}

/// Writes one row per draw: β1..β4 on the natural scale, then the normalized log weight.
pub fn write_weighted_samples(path: &Path, sample: &ImportanceSample) -> Result<(), OutputError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    writer.write_record(SAMPLE_HEADER)?;
    for draw in sample.samples() {
        let beta = draw.beta;
        writer.write_record(&[
            beta.beta1.to_string(),
            beta.beta2.to_string(),
            beta.beta3.to_string(),
            beta.beta4.to_string(),
            draw.log_weight.to_string(),
        ])?;
    }
    writer.flush()?;
    log::info!("Wrote {} weighted draws to '{}'", sample.len(), path.display());
    Ok(())
}

/// The Laplace fit in reportable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaplaceReport {
    /// Posterior mode on the optimization scale (β1, β2, ln β3, ln β4).
    pub theta_mode: [f64; NUM_PARAMS],
    pub beta_mode: Coefficients4,
    pub covariance: Vec<[f64; NUM_PARAMS]>,
    pub standard_errors: [f64; NUM_PARAMS],
    pub log_posterior_at_mode: f64,
    pub iterations: usize,
}

impl LaplaceReport {
    pub fn from_approximation(laplace: &LaplaceApproximation) -> Self {
        let mode = laplace.mode();
        let standard_errors = laplace.standard_errors();
        Self {
            theta_mode: mode.0,
            beta_mode: theta_to_beta(&mode),
            covariance: laplace
                .covariance
                .rows()
                .into_iter()
                .map(|row| std::array::from_fn(|j| row[j]))
                .collect(),
            standard_errors: std::array::from_fn(|j| standard_errors[j]),
            log_posterior_at_mode: laplace.log_posterior_at_mode,
            iterations: laplace.iterations,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), OutputError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, OutputError> {
        load_toml(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSummary {
    pub mean: f64,
    pub interval: CredibleInterval,
}

/// Posterior summary after importance sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub draws: usize,
    pub seed: u64,
    pub effective_sample_size: f64,
    pub laplace: LaplaceReport,
    pub beta1: CoefficientSummary,
    pub beta2: CoefficientSummary,
    pub beta3: CoefficientSummary,
    pub beta4: CoefficientSummary,
}

impl PosteriorSummary {
    pub fn new(
        laplace: &LaplaceApproximation,
        sample: &ImportanceSample,
        seed: u64,
        coverage: f64,
    ) -> Result<Self, InferenceError> {
        let means = sample.weighted_means();
        let intervals = sample.credible_intervals(coverage)?;
        let coefficient = |i: usize| CoefficientSummary {
            mean: means[i],
            interval: intervals[i],
        };
        Ok(Self {
            draws: sample.len(),
            seed,
            effective_sample_size: sample.effective_sample_size(),
            laplace: LaplaceReport::from_approximation(laplace),
            beta1: coefficient(0),
            beta2: coefficient(1),
            beta3: coefficient(2),
            beta4: coefficient(3),
        })
    }

    pub fn coefficients(&self) -> [&CoefficientSummary; NUM_PARAMS] {
        [&self.beta1, &self.beta2, &self.beta3, &self.beta4]
    }

    pub fn save(&self, path: &Path) -> Result<(), OutputError> {
        save_toml(self, path)
    }

    pub fn load(path: &Path) -> Result<Self, OutputError> {
        load_toml(path)
    }
}

fn save_toml<T: Serialize>(value: &T, path: &Path) -> Result<(), OutputError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    file.flush()?;
    log::info!("Saved '{}'", path.display());
    Ok(())
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, OutputError> {
    let toml_string = fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_string)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::{ModeOptions, find_mode};
    use crate::importance::do_importance;
    use crate::types::{Hyperparameter4, Observations, Parameter4};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use tempfile::tempdir;

    fn fitted() -> (LaplaceApproximation, ImportanceSample) {
        let obs = Observations::new(
            array![1.0, 2.0, 3.0, 4.0, 5.0],
            array![1.1, 2.0, 2.9, 4.2, 4.8],
        )
        .unwrap();
        let gamma = Hyperparameter4::new([1.0; 4]).unwrap();
        let laplace =
            find_mode(&Parameter4::zeros(), &obs, &gamma, &ModeOptions::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let sample = do_importance(50, &laplace, &obs, &gamma, &mut rng).unwrap();
        (laplace, sample)
    }

    #[test]
    fn samples_file_has_header_and_one_row_per_draw() {
        let (_, sample) = fitted();
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.tsv");
        write_weighted_samples(&path, &sample).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("beta1\tbeta2\tbeta3\tbeta4\tlog_weight"));
        let rows: Vec<Vec<f64>> = lines
            .map(|line| line.split('\t').map(|v| v.parse().unwrap()).collect())
            .collect();
        assert_eq!(rows.len(), 50);
        for (row, draw) in rows.iter().zip(sample.samples()) {
            assert_eq!(row.len(), 5);
            assert_eq!(row[1], draw.beta.beta2);
            assert_eq!(row[4], draw.log_weight);
        }
        let total: f64 = rows.iter().map(|r| r[4].exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-8);
    }

    #[test]
    fn summary_survives_toml_round_trip() {
        let (laplace, sample) = fitted();
        let summary = PosteriorSummary::new(&laplace, &sample, 11, 0.9).unwrap();
        assert_eq!(summary.draws, 50);
        assert_eq!(summary.laplace.covariance.len(), NUM_PARAMS);
        assert!(summary.coefficients().iter().all(|c| c.interval.coverage == 0.9));

        let dir = tempdir().unwrap();
        let path = dir.path().join("summary.toml");
        summary.save(&path).unwrap();
        let loaded = PosteriorSummary::load(&path).unwrap();
        assert_eq!(loaded.draws, summary.draws);
        assert_eq!(loaded.laplace.theta_mode, summary.laplace.theta_mode);
        assert_abs_diff_eq!(loaded.beta2.mean, summary.beta2.mean, epsilon = 1e-12);
        assert_abs_diff_eq!(
            loaded.beta2.interval.upper,
            summary.beta2.interval.upper,
            epsilon = 1e-12
        );
    }

    #[test]
    fn laplace_report_matches_fit() {
        let (laplace, _) = fitted();
        let report = LaplaceReport::from_approximation(&laplace);
        assert_abs_diff_eq!(report.beta_mode.beta3, report.theta_mode[2].exp(), epsilon = 1e-12);
        for i in 0..NUM_PARAMS {
            assert_abs_diff_eq!(
                report.standard_errors[i] * report.standard_errors[i],
                report.covariance[i][i],
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn loading_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = PosteriorSummary::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(OutputError::IoError(_))));
    }
}
