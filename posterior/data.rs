//! # Data Loading and Validation Module
//!
//! Reads the weight table (`Index`, `Date`, `Material`, `CAD_Weight`,
//! `Actual_Weight`) and turns the two numeric columns into validated
//! `Observations`. Only `CAD_Weight` and `Actual_Weight` are required;
//! `Material` is consulted only when a material filter is requested.
//!
//! - Strict Schema: column names are not configurable.
//! - User-Centric Errors: failures are assumed to be user-input errors and
//!   `DataError` says which column is at fault.
//! - Separator: `.tsv` files are tab-separated, everything else comma-separated.

use crate::types::{InferenceError, Observations};
use ndarray::Array1;
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const CAD_WEIGHT_COLUMN: &str = "CAD_Weight";
pub const ACTUAL_WEIGHT_COLUMN: &str = "Actual_Weight";
pub const MATERIAL_COLUMN: &str = "Material";

const MINIMUM_ROWS: usize = 2;

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. Complete data is required."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Input contains only {found} usable rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("Loaded observations are inconsistent: {0}")]
    Inconsistent(#[from] InferenceError),
}

/// Options controlling which rows are loaded.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Keep only rows whose `Material` equals this value.
    pub material: Option<String>,
}

/// Loads the CAD/actual weight pairs from a delimited file.
pub fn load_observations(path: &Path, options: &LoadOptions) -> Result<Observations, DataError> {
    log::info!("Loading observations from '{}'", path.display());
    let separator = if path.extension().is_some_and(|ext| ext == "tsv") {
        b'\t'
    } else {
        b','
    };

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let mut required = vec![CAD_WEIGHT_COLUMN, ACTUAL_WEIGHT_COLUMN];
    if options.material.is_some() {
        required.push(MATERIAL_COLUMN);
    }
    for name in required {
        if !column_names.iter().any(|c| c == name) {
            return Err(DataError::ColumnNotFound(name.to_string()));
        }
    }

    let x = extract_numeric_column(&df, CAD_WEIGHT_COLUMN)?;
    let y = extract_numeric_column(&df, ACTUAL_WEIGHT_COLUMN)?;

    let keep: Vec<bool> = match &options.material {
        Some(material) => extract_string_column(&df, MATERIAL_COLUMN)?
            .iter()
            .map(|value| value.as_deref() == Some(material.as_str()))
            .collect(),
        None => vec![true; x.len()],
    };

    let (x, y): (Vec<f64>, Vec<f64>) = x
        .into_iter()
        .zip(y)
        .zip(keep)
        .filter_map(|(pair, keep)| keep.then_some(pair))
        .unzip();

    if x.len() < MINIMUM_ROWS {
        return Err(DataError::InsufficientRows {
            found: x.len(),
            required: MINIMUM_ROWS,
        });
    }

    if let Some(material) = &options.material {
        log::info!("Kept {} rows with {} = '{}'", x.len(), MATERIAL_COLUMN, material);
    } else {
        log::info!("Loaded {} observations", x.len());
    }
    Ok(Observations::new(Array1::from_vec(x), Array1::from_vec(y))?)
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

fn extract_string_column(
    df: &DataFrame,
    column_name: &str,
) -> Result<Vec<Option<String>>, DataError> {
    let casted = df.column(column_name)?.cast(&DataType::String)?;
    let chunked = casted.str()?;
    Ok(chunked
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}
