//! # Inference
//!
//! Pointwise intervals on the log-odds scale built from the fitted covariance:
//!
//! `var_i = sum_j (B C)_ij B_ij * scale^2`
//!
//! where `B` holds the basis rows of the selected term and `C` the matching
//! block of the coefficient covariance. Prediction intervals add `scale^2` for
//! response noise. Critical values come from a Student-t distribution whose
//! degrees of freedom are the model's effective degrees of freedom.

use crate::model::{ModelError, TrainedModel};
use crate::types::sigmoid;
use ndarray::{Array1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Which interval bounds to compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntervalSpec {
    /// Two-sided coverage in [0, 1], e.g. `0.95` for the 2.5% and 97.5% bounds.
    Width(f64),
    /// Explicit quantile levels in [0, 1].
    Quantiles(Vec<f64>),
}

impl Default for IntervalSpec {
    fn default() -> Self {
        Self::Width(0.95)
    }
}

impl IntervalSpec {
    /// The quantile levels this spec asks for, validated.
    pub fn quantiles(&self) -> Result<Vec<f64>, ModelError> {
        match self {
            Self::Width(width) => {
                if !(0.0..=1.0).contains(width) {
                    return Err(ModelError::InvalidWidth(*width));
                }
                let alpha = (1.0 - width) / 2.0;
                Ok(vec![alpha, 1.0 - alpha])
            }
            Self::Quantiles(levels) => {
                if let Some(&bad) = levels.iter().find(|q| !(0.0..=1.0).contains(*q)) {
                    return Err(ModelError::InvalidQuantile(bad));
                }
                Ok(levels.clone())
            }
        }
    }
}

/// Isolated smooth effect of one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialDependence {
    /// 1-based feature index, as used by the feature selectors.
    pub feature: usize,
    /// The feature's contribution to the log-odds.
    pub effect: Array1<f64>,
    /// One bound per requested quantile level, on the log-odds scale.
    pub bounds: Vec<Array1<f64>>,
}

impl TrainedModel {
    /// Confidence bounds on the probability scale for the term selected by
    /// `feature` (`-1` for the full model).
    pub fn confidence_intervals(
        &self,
        x: ArrayView2<f64>,
        spec: &IntervalSpec,
        feature: isize,
    ) -> Result<Vec<Array1<f64>>, ModelError> {
        let quantiles = spec.quantiles()?;
        let bounds = self.log_odds_intervals(x, &quantiles, feature, false)?;
        Ok(bounds.into_iter().map(|b| b.mapv(sigmoid)).collect())
    }

    /// Like [`TrainedModel::confidence_intervals`] for the full model, widened
    /// by the response noise.
    pub fn prediction_intervals(
        &self,
        x: ArrayView2<f64>,
        spec: &IntervalSpec,
    ) -> Result<Vec<Array1<f64>>, ModelError> {
        let quantiles = spec.quantiles()?;
        let bounds = self.log_odds_intervals(x, &quantiles, -1, true)?;
        Ok(bounds.into_iter().map(|b| b.mapv(sigmoid)).collect())
    }

    /// One [`PartialDependence`] per feature, intercept excluded. Bounds are
    /// left on the log-odds scale.
    pub fn partial_dependence(
        &self,
        x: ArrayView2<f64>,
        spec: &IntervalSpec,
    ) -> Result<Vec<PartialDependence>, ModelError> {
        let quantiles = spec.quantiles()?;
        (1..=self.num_features())
            .map(|feature| {
                let index = feature as isize;
                Ok(PartialDependence {
                    feature,
                    effect: self.linear_predictor(x, index)?.into_inner(),
                    bounds: self.log_odds_intervals(x, &quantiles, index, false)?,
                })
            })
            .collect()
    }

    fn log_odds_intervals(
        &self,
        x: ArrayView2<f64>,
        quantiles: &[f64],
        feature: isize,
        prediction: bool,
    ) -> Result<Vec<Array1<f64>>, ModelError> {
        let statistics = self.statistics()?;
        let range = self.select_feature(feature)?;
        let eta = self.linear_predictor(x, feature)?;
        let basis = self.bases(x, feature)?.to_dense();

        let covariance = statistics.covariance.slice(s![range.clone(), range]);
        let scale_sq = statistics.scale * statistics.scale;
        let mut variance = (basis.dot(&covariance) * &basis).sum_axis(Axis(1)) * scale_sq;
        if prediction {
            variance += scale_sq;
        }
        let std_dev = variance.mapv(f64::sqrt);

        quantiles
            .iter()
            .map(|&q| {
                let t = student_t_quantile(q, statistics.edof)?;
                Ok(&*eta + &(&std_dev * t))
            })
            .collect()
    }
}

/// Quantile of a standard Student-t distribution; the levels 0 and 1 map to
/// the infinities.
pub fn student_t_quantile(q: f64, df: f64) -> Result<f64, ModelError> {
    if !(0.0..=1.0).contains(&q) {
        return Err(ModelError::InvalidQuantile(q));
    }
    if q == 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    if q == 1.0 {
        return Ok(f64::INFINITY);
    }
    let dist = StudentsT::new(0.0, 1.0, df).map_err(|_| ModelError::InvalidDegreesOfFreedom(df))?;
    Ok(dist.inverse_cdf(q))
}
