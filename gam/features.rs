//! # Feature Typing
//!
//! Every raw input column is classified once per fit as either categorical
//! (integer-coded categories `min..=max` with no gaps) or continuous. The
//! classification drives knot placement, the default spline order, and the
//! default penalty for that column.

use ndarray::{ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a raw column was stored before it reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnStorage {
    /// Integer-typed column (e.g. an `Int64` column of a TSV file).
    Integer,
    /// Floating-point column.
    Real,
}

/// The statistical type of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    Categorical,
    Continuous,
}

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Feature column {column} is empty.")]
    EmptyColumn { column: usize },

    #[error("Feature column {column} contains non-finite values.")]
    NonFiniteValues { column: usize },

    #[error(
        "Feature column {column} looks categorical but its {num_unique} categories span [{min}, {max}]; k categories must be mapped to integers in a contiguous [0, k-1] interval."
    )]
    NonContiguousCategories {
        column: usize,
        num_unique: usize,
        min: f64,
        max: f64,
    },
}

/// Classifies each column of `x`.
///
/// A column is categorical when it is integer-stored, or when adding independent
/// standard-normal jitter changes its number of unique values, which only
/// happens when the column repeats values. Categorical columns must hold
/// integral values with `max - min == #unique - 1`.
pub fn classify_features<R: Rng + ?Sized>(
    x: ArrayView2<f64>,
    storage: &[ColumnStorage],
    rng: &mut R,
) -> Result<Vec<FeatureKind>, FeatureError> {
    let jitter: Vec<f64> = (0..x.nrows()).map(|_| rng.sample(StandardNormal)).collect();

    x.columns()
        .into_iter()
        .zip(storage.iter())
        .enumerate()
        .map(|(column, (values, &stored))| classify_column(column, values, stored, &jitter))
        .collect()
}

fn classify_column(
    column: usize,
    values: ArrayView1<f64>,
    stored: ColumnStorage,
    jitter: &[f64],
) -> Result<FeatureKind, FeatureError> {
    if values.is_empty() {
        return Err(FeatureError::EmptyColumn { column });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(FeatureError::NonFiniteValues { column });
    }

    let uniques = unique_sorted(values.iter().copied());
    let jittered = unique_sorted(values.iter().zip(jitter).map(|(v, j)| v + j));

    let looks_discrete = stored == ColumnStorage::Integer || uniques.len() != jittered.len();
    if !looks_discrete {
        return Ok(FeatureKind::Continuous);
    }

    let min = uniques[0];
    let max = uniques[uniques.len() - 1];
    let integral = uniques.iter().all(|v| v.fract() == 0.0);
    if !integral || max - min != (uniques.len() - 1) as f64 {
        return Err(FeatureError::NonContiguousCategories {
            column,
            num_unique: uniques.len(),
            min,
            max,
        });
    }
    Ok(FeatureKind::Categorical)
}

/// Sorted, deduplicated copy of the values.
pub(crate) fn unique_sorted(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.collect();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    sorted.dedup();
    sorted
}
