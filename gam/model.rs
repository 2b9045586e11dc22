use crate::config::GamConfig;
use crate::construction::{FeatureSpec, LayoutError, ModelLayout, build_bases};
use crate::estimate::{self, EstimationError, FitReport};
use crate::features::ColumnStorage;
use crate::inference::{IntervalSpec, PartialDependence};
use crate::matrix::DesignMatrix;
use crate::pirls::{self, FitStatistics};
use crate::types::{Coefficients, LinearPredictor};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::Range;
use thiserror::Error;

/// Distance kept between predicted probabilities and the bounds 0 and 1.
pub const PROBABILITY_CLAMP: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The model has not been fitted yet.")]
    NotFitted,
    #[error(
        "Fit statistics are unavailable because the last fit did not converge; increase n_iter or the smoothing strength."
    )]
    StatisticsUnavailable,
    #[error("{0}")]
    Layout(#[from] LayoutError),
    #[error("Labels have {found} entries, but the data has {expected} rows.")]
    MismatchedLabelCount { found: usize, expected: usize },
    #[error("{found} feature names were given for a model with {expected} features.")]
    MismatchedFeatureNames { found: usize, expected: usize },
    #[error("Interval width must lie in [0, 1], but was {0}.")]
    InvalidWidth(f64),
    #[error("Quantile levels must lie in [0, 1], but {0} was requested.")]
    InvalidQuantile(f64),
    #[error("Student-t distribution is undefined for {0} degrees of freedom.")]
    InvalidDegreesOfFreedom(f64),
}

/// Everything needed to reproduce predictions of a fitted model.
///
/// This is the on-disk format written by [`TrainedModel::save`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    /// Input column names, one per feature; empty when the caller never named
    /// the columns.
    #[serde(default)]
    pub feature_names: Vec<String>,
    /// Knots, kind and order per feature, in input column order.
    pub features: Vec<FeatureSpec>,
    pub layout: ModelLayout,
    /// Smoothing strength per term, intercept first.
    pub lambdas: Vec<f64>,
    pub coefficients: Coefficients,
    /// Present only when the fit converged.
    pub statistics: Option<FitStatistics>,
}

impl TrainedModel {
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Attaches the column names the features were fitted on.
    pub fn with_feature_names(mut self, names: Vec<String>) -> Result<Self, ModelError> {
        if names.len() != self.num_features() {
            return Err(ModelError::MismatchedFeatureNames {
                found: names.len(),
                expected: self.num_features(),
            });
        }
        self.feature_names = names;
        Ok(self)
    }

    /// Coefficient range owned by `feature` (`-1` all, `0` intercept).
    pub fn select_feature(&self, feature: isize) -> Result<Range<usize>, ModelError> {
        Ok(self.layout.select(feature)?)
    }

    /// Rebuilds the basis columns of `feature` for new data.
    pub fn bases(&self, x: ArrayView2<f64>, feature: isize) -> Result<DesignMatrix, ModelError> {
        Ok(build_bases(x, &self.features, feature)?)
    }

    /// Contribution of `feature` to the log-odds; `-1` gives the full
    /// linear predictor.
    pub fn linear_predictor(
        &self,
        x: ArrayView2<f64>,
        feature: isize,
    ) -> Result<LinearPredictor, ModelError> {
        let range = self.select_feature(feature)?;
        let design = self.bases(x, feature)?;
        let beta = self.coefficients.slice(ndarray::s![range]).to_owned();
        Ok(LinearPredictor::new(design.matrix_vector_multiply(&beta)))
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let mut proba = self.linear_predictor(x, -1)?.probabilities();
        proba.mapv_inplace(|p| p.clamp(PROBABILITY_CLAMP, 1.0 - PROBABILITY_CLAMP));
        Ok(proba)
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<bool>, ModelError> {
        Ok(self.predict_proba(x)?.mapv(|p| p > 0.5))
    }

    pub fn accuracy(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        check_labels(x, y)?;
        let proba = self.predict_proba(x)?;
        Ok(pirls::accuracy(y, proba.view()))
    }

    /// Bernoulli log-likelihood of `y` under the fitted probabilities.
    pub fn log_likelihood(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        check_labels(x, y)?;
        let proba = self.predict_proba(x)?;
        Ok(pirls::log_likelihood(y, proba.view()))
    }

    pub fn statistics(&self) -> Result<&FitStatistics, ModelError> {
        self.statistics.as_ref().ok_or(ModelError::StatisticsUnavailable)
    }

    pub fn standard_errors(&self) -> Result<&Array1<f64>, ModelError> {
        Ok(&self.statistics()?.standard_errors)
    }

    pub fn covariance(&self) -> Result<&Array2<f64>, ModelError> {
        Ok(&self.statistics()?.covariance)
    }

    pub fn edof(&self) -> Result<f64, ModelError> {
        Ok(self.statistics()?.edof)
    }

    /// Akaike information criterion, `-2 loglik + 2 edof`.
    pub fn aic(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        let edof = self.edof()?;
        Ok(-2.0 * self.log_likelihood(x, y)? + 2.0 * edof)
    }

    /// AIC with the small-sample correction `2 (edof + 1)(edof + 2) / (n - edof - 2)`.
    pub fn aicc(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        let edof = self.edof()?;
        let n = y.len() as f64;
        Ok(self.aic(x, y)? + 2.0 * (edof + 1.0) * (edof + 2.0) / (n - edof - 2.0))
    }

    /// Saves the trained model to a TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

fn check_labels(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
    if x.nrows() != y.len() {
        return Err(ModelError::MismatchedLabelCount {
            found: y.len(),
            expected: x.nrows(),
        });
    }
    Ok(())
}

/// A logistic GAM: the user configuration plus the state of the last fit.
///
/// Fitting again warm-starts from the previous coefficients when the new
/// layout has the same number of columns; call [`LogisticGam::reset`] for a
/// cold start.
#[derive(Debug, Clone, Default)]
pub struct LogisticGam {
    config: GamConfig,
    model: Option<TrainedModel>,
}

impl LogisticGam {
    pub fn new(config: GamConfig) -> Self {
        Self {
            config,
            model: None,
        }
    }

    pub fn model(&self) -> Result<&TrainedModel, ModelError> {
        self.model.as_ref().ok_or(ModelError::NotFitted)
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    /// Fits the model in place. Non-convergence is reported through the
    /// returned [`FitReport`], not as an error.
    pub fn fit(
        &mut self,
        x: ArrayView2<f64>,
        storage: &[ColumnStorage],
        y: ArrayView1<f64>,
    ) -> Result<FitReport, EstimationError> {
        let warm_start = self.model.as_ref().map(|model| &model.coefficients);
        let (model, report) = estimate::train(x, storage, y, &self.config, warm_start)?;
        self.model = Some(model);
        Ok(report)
    }

    /// Forgets the fitted state so the next fit starts from zeros.
    pub fn reset(&mut self) {
        self.model = None;
    }

    pub fn coefficients(&self) -> Result<&Coefficients, ModelError> {
        Ok(&self.model()?.coefficients)
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        self.model()?.predict_proba(x)
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<bool>, ModelError> {
        self.model()?.predict(x)
    }

    pub fn accuracy(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        self.model()?.accuracy(x, y)
    }

    pub fn log_likelihood(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        self.model()?.log_likelihood(x, y)
    }

    pub fn aic(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        self.model()?.aic(x, y)
    }

    pub fn aicc(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, ModelError> {
        self.model()?.aicc(x, y)
    }

    pub fn linear_predictor(
        &self,
        x: ArrayView2<f64>,
        feature: isize,
    ) -> Result<LinearPredictor, ModelError> {
        self.model()?.linear_predictor(x, feature)
    }

    pub fn bases(&self, x: ArrayView2<f64>, feature: isize) -> Result<DesignMatrix, ModelError> {
        self.model()?.bases(x, feature)
    }

    pub fn confidence_intervals(
        &self,
        x: ArrayView2<f64>,
        spec: &IntervalSpec,
        feature: isize,
    ) -> Result<Vec<Array1<f64>>, ModelError> {
        self.model()?.confidence_intervals(x, spec, feature)
    }

    pub fn prediction_intervals(
        &self,
        x: ArrayView2<f64>,
        spec: &IntervalSpec,
    ) -> Result<Vec<Array1<f64>>, ModelError> {
        self.model()?.prediction_intervals(x, spec)
    }

    pub fn partial_dependence(
        &self,
        x: ArrayView2<f64>,
        spec: &IntervalSpec,
    ) -> Result<Vec<PartialDependence>, ModelError> {
        self.model()?.partial_dependence(x, spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerFeature;
    use crate::features::FeatureKind;
    use crate::pirls::PirlsStatus;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};

    fn toy_model() -> TrainedModel {
        let features = vec![FeatureSpec {
            kind: FeatureKind::Categorical,
            knots: array![-0.5, 0.5, 1.5, 2.5],
            spline_order: 1,
        }];
        let layout = ModelLayout::from_features(&features);
        TrainedModel {
            feature_names: Vec::new(),
            features,
            layout,
            lambdas: vec![0.0, 0.6],
            coefficients: Coefficients::new(array![0.5, -1.0, 0.0, 1.0]),
            statistics: None,
        }
    }

    #[test]
    fn linear_predictor_adds_intercept_and_feature_effects() {
        let model = toy_model();
        let x = array![[0.0], [1.0], [2.0]];
        let eta = model.linear_predictor(x.view(), -1).unwrap();
        assert_eq!(*eta, array![-0.5, 0.5, 1.5]);

        let intercept = model.linear_predictor(x.view(), 0).unwrap();
        let feature = model.linear_predictor(x.view(), 1).unwrap();
        assert_eq!(&*intercept + &*feature, *eta);
        assert_eq!(model.predict(x.view()).unwrap(), array![false, true, true]);
    }

    #[test]
    fn feature_names_must_cover_every_feature() {
        let named = toy_model().with_feature_names(vec!["group".to_string()]).unwrap();
        assert_eq!(named.feature_names, vec!["group"]);
        assert!(matches!(
            toy_model().with_feature_names(vec!["a".to_string(), "b".to_string()]),
            Err(ModelError::MismatchedFeatureNames { found: 2, expected: 1 })
        ));
    }

    #[test]
    fn predictions_stay_strictly_inside_the_unit_interval() {
        let mut model = toy_model();
        model.coefficients = Coefficients::new(array![0.0, -1e4, 0.0, 1e4]);
        let proba = model.predict_proba(array![[0.0], [2.0]].view()).unwrap();
        assert!(proba.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn statistics_are_required_for_information_criteria() {
        let model = toy_model();
        let x = array![[0.0], [1.0]];
        let y = array![0.0, 1.0];
        assert!(model.log_likelihood(x.view(), y.view()).is_ok());
        assert!(matches!(
            model.aic(x.view(), y.view()),
            Err(ModelError::StatisticsUnavailable)
        ));
        assert!(matches!(
            model.accuracy(x.view(), array![1.0].view()),
            Err(ModelError::MismatchedLabelCount { found: 1, expected: 2 })
        ));
    }

    #[test]
    fn unfitted_model_reports_not_fitted() {
        let gam = LogisticGam::default();
        assert!(!gam.is_fitted());
        assert!(matches!(
            gam.predict_proba(array![[1.0]].view()),
            Err(ModelError::NotFitted)
        ));
    }

    #[test]
    fn refit_after_reset_is_idempotent() {
        let n = 200;
        let x = Array::linspace(-3.0, 3.0, n).insert_axis(ndarray::Axis(1));
        let y = Array::from_iter((0..n).map(|i| if (i * 37) % 11 < 2 + 8 * i / n { 1.0 } else { 0.0 }));
        let config = GamConfig::default()
            .with_n_knots(PerFeature::Broadcast(5))
            .with_seed(3);
        let mut gam = LogisticGam::new(config);

        let first = gam.fit(x.view(), &[ColumnStorage::Real], y.view()).unwrap();
        assert_eq!(first.status, PirlsStatus::Converged);
        let beta = gam.coefficients().unwrap().clone();

        gam.reset();
        assert!(!gam.is_fitted());
        gam.fit(x.view(), &[ColumnStorage::Real], y.view()).unwrap();
        let again = gam.coefficients().unwrap();
        for (a, b) in beta.iter().zip(again.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }

        let aic = gam.aic(x.view(), y.view()).unwrap();
        assert_abs_diff_eq!(aic, first.aic.unwrap(), epsilon = 1e-8);
    }
}
