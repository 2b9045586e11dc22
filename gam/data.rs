//! # Data Loading
//!
//! Reads tab-separated files with a header row into the `ndarray` structures
//! consumed by the engine. One column (by default `y`) holds the binary
//! response; every other column of a training file is a feature, kept in file
//! order. Prediction files are read by the feature names a model was trained
//! with, so their column order does not matter. The storage
//! type polars infers for a column (integer or floating point) is carried
//! along as a [`ColumnStorage`], since integer-typed columns are always
//! treated as categorical.

use crate::features::ColumnStorage;
use ndarray::{Array1, Array2, ShapeBuilder};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_TARGET_COLUMN: &str = "y";

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
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the column '{0}'. This tool requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("The input file has no feature columns besides '{0}'.")]
    NoFeatureColumns(String),
}

/// Feature columns of a file, as a row-major sample matrix.
#[derive(Debug)]
pub struct FeatureTable {
    pub names: Vec<String>,
    /// Shape `[n_samples, n_features]`.
    pub x: Array2<f64>,
    pub storage: Vec<ColumnStorage>,
}

#[derive(Debug)]
pub struct TrainingData {
    pub features: FeatureTable,
    pub y: Array1<f64>,
}

/// Loads a training file: the `target` column plus every other column as a
/// feature.
pub fn load_training_data(path: &str, target: &str) -> Result<TrainingData, DataError> {
    let df = read_tsv(path)?;
    if !has_column(&df, target) {
        return Err(DataError::ColumnNotFound(target.to_string()));
    }
    let (y, _) = extract_numeric_column(&df, target)?;
    let features = extract_features(&df, feature_columns(&df, target)?)?;
    Ok(TrainingData {
        features,
        y: Array1::from_vec(y),
    })
}

/// Loads a prediction file, picking the feature columns named in
/// `feature_names` in that order. With no names, every column except `target`
/// is taken in file order.
pub fn load_prediction_data(
    path: &str,
    target: &str,
    feature_names: &[String],
) -> Result<FeatureTable, DataError> {
    let df = read_tsv(path)?;
    let names = if feature_names.is_empty() {
        feature_columns(&df, target)?
    } else {
        if let Some(missing) = feature_names.iter().find(|name| !has_column(&df, name.as_str())) {
            return Err(DataError::ColumnNotFound(missing.clone()));
        }
        feature_names.to_vec()
    };
    extract_features(&df, names)
}

fn read_tsv(path: &str) -> Result<DataFrame, DataError> {
    log::info!("Loading data from '{path}'");
    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;
    log::info!("Loaded {} rows and {} columns.", df.height(), df.width());
    Ok(df)
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().iter().any(|c| c.as_str() == name)
}

/// Every column except `target`, in file order.
fn feature_columns(df: &DataFrame, target: &str) -> Result<Vec<String>, DataError> {
    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|c| c.to_string())
        .filter(|c| c != target)
        .collect();
    if names.is_empty() {
        return Err(DataError::NoFeatureColumns(target.to_string()));
    }
    Ok(names)
}

fn extract_features(df: &DataFrame, names: Vec<String>) -> Result<FeatureTable, DataError> {
    let n = df.height();
    let mut buffer = Vec::with_capacity(n * names.len());
    let mut storage = Vec::with_capacity(names.len());
    for name in &names {
        let (mut values, stored) = extract_numeric_column(df, name)?;
        buffer.append(&mut values);
        storage.push(stored);
    }

    // Columns were appended one after another, hence the column-major shape.
    let x = Array2::from_shape_vec((n, names.len()).f(), buffer).map_err(|err| {
        DataError::ColumnWrongType {
            column_name: names.join(","),
            expected_type: "equal-length numeric columns",
            found_type: err.to_string(),
        }
    })?;

    Ok(FeatureTable { names, x, storage })
}

fn extract_numeric_column(
    df: &DataFrame,
    column_name: &str,
) -> Result<(Vec<f64>, ColumnStorage), DataError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValuesFound(column_name.to_string()));
    }

    let dtype = series.dtype();
    let stored = if dtype.is_integer() {
        ColumnStorage::Integer
    } else if dtype.is_float() {
        ColumnStorage::Real
    } else {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "integer or floating point",
            found_type: format!("{dtype:?}"),
        });
    };

    let casted = series.cast(&DataType::Float64)?;
    let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok((values, stored))
}
