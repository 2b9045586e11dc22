//! # Model Estimation
//!
//! Orchestrates a single fit: feature typing, configuration resolution, knot
//! placement, design and penalty assembly, and the P-IRLS loop. The result is a
//! self-contained [`TrainedModel`] plus a [`FitReport`] describing this fit's
//! iteration history.

use crate::basis::{self, BasisError};
use crate::config::{ConfigError, GamConfig};
use crate::construction::{FeatureSpec, LayoutError, ModelLayout, PenaltyMatrix, build_bases};
use crate::features::{ColumnStorage, FeatureError, classify_features};
use crate::model::TrainedModel;
use crate::pirls::{self, IterationLog, PirlsStatus};
use crate::types::Coefficients;
use ndarray::{ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] BasisError),

    #[error("Feature typing failed: {0}")]
    FeatureError(#[from] FeatureError),

    #[error("Invalid model configuration: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Model layout could not be built: {0}")]
    ModelLayout(#[from] LayoutError),

    #[error("A linear system solve failed. The penalized Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error(
        "Every fitted probability is exactly 0 or 1; the model is saturated and cannot be updated."
    )]
    ProbabilitiesSaturated,

    #[error("The response must contain only 0 and 1, but row {row} holds {value}.")]
    InvalidResponse { row: usize, value: f64 },

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("The SVD of the penalized system returned no singular vectors.")]
    SvdVectorsMissing,
}

/// Diagnostics of one call to [`train`]. A new report replaces the previous one
/// on every fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub status: PirlsStatus,
    pub iterations: usize,
    /// One entry per iteration, in order.
    pub logs: Vec<IterationLog>,
    /// Only available for converged fits.
    pub aic: Option<f64>,
    pub aicc: Option<f64>,
}

impl FitReport {
    pub fn converged(&self) -> bool {
        self.status == PirlsStatus::Converged
    }

    /// Training accuracy recorded at every iteration.
    pub fn accuracy_history(&self) -> Vec<f64> {
        self.logs.iter().map(|log| log.accuracy).collect()
    }

    /// Negative log-likelihood recorded at every iteration.
    pub fn neg_log_likelihood_history(&self) -> Vec<f64> {
        self.logs.iter().map(|log| log.neg_log_likelihood).collect()
    }

    /// Relative coefficient change recorded at every iteration.
    pub fn coefficient_change_history(&self) -> Vec<f64> {
        self.logs.iter().map(|log| log.coefficient_change).collect()
    }
}

/// Fits a logistic GAM to `x` (one column per feature) and the binary `y`.
///
/// `warm_start` is used as the starting point only when its length matches the
/// new model's coefficient count; otherwise the fit starts from zeros.
pub fn train(
    x: ArrayView2<f64>,
    storage: &[ColumnStorage],
    y: ArrayView1<f64>,
    config: &GamConfig,
    warm_start: Option<&Coefficients>,
) -> Result<(TrainedModel, FitReport), EstimationError> {
    validate_inputs(x, storage, y)?;
    log::info!(
        "Starting logistic GAM fit with {} samples and {} features.",
        x.nrows(),
        x.ncols()
    );

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    // 1. Type every feature and expand the per-feature settings.
    let kinds = classify_features(x, storage, &mut rng)?;
    let resolved = config.resolve(&kinds)?;
    log::debug!("Feature kinds: {kinds:?}");

    // 2. Place knots and describe each feature's basis.
    let features = kinds
        .iter()
        .enumerate()
        .map(|(i, &kind)| {
            let knots = basis::generate_knots(x.column(i), kind, resolved.n_knots[i], true)?;
            Ok(FeatureSpec {
                kind,
                knots,
                spline_order: resolved.spline_orders[i],
            })
        })
        .collect::<Result<Vec<_>, EstimationError>>()?;

    // 3. Assemble the design and the block-diagonal penalty.
    let layout = ModelLayout::from_features(&features);
    let design = build_bases(x, &features, -1)?;
    let penalty = PenaltyMatrix::assemble(&layout, &resolved.penalties, &kinds, &resolved.lambdas)?;
    log_layout_info(&layout, &features);

    let initial = match warm_start {
        Some(beta) if beta.len() == layout.total_coeffs() => {
            log::info!("Warm-starting from the previous coefficients.");
            beta.clone()
        }
        _ => Coefficients::zeros(layout.total_coeffs()),
    };

    // 4. Run P-IRLS.
    let result = pirls::fit_pirls(
        &design,
        y,
        &penalty,
        config.solver,
        config.n_iter,
        config.tol,
        initial,
        &mut rng,
    )?;

    let model = TrainedModel {
        feature_names: Vec::new(),
        features,
        layout,
        lambdas: resolved.lambdas,
        coefficients: result.beta,
        statistics: result.statistics,
    };

    let (aic, aicc) = if model.statistics.is_some() {
        (model.aic(x, y).ok(), model.aicc(x, y).ok())
    } else {
        (None, None)
    };

    let report = FitReport {
        status: result.status,
        iterations: result.logs.len(),
        logs: result.logs,
        aic,
        aicc,
    };
    Ok((model, report))
}

fn validate_inputs(
    x: ArrayView2<f64>,
    storage: &[ColumnStorage],
    y: ArrayView1<f64>,
) -> Result<(), EstimationError> {
    if x.nrows() != y.len() {
        return Err(EstimationError::DimensionMismatch(format!(
            "x has {} rows but y has {} entries",
            x.nrows(),
            y.len()
        )));
    }
    if storage.len() != x.ncols() {
        return Err(EstimationError::DimensionMismatch(format!(
            "x has {} columns but {} column storage types were given",
            x.ncols(),
            storage.len()
        )));
    }
    if x.ncols() == 0 {
        return Err(EstimationError::DimensionMismatch(
            "at least one feature column is required".to_string(),
        ));
    }
    if let Some((row, &value)) = y
        .iter()
        .enumerate()
        .find(|(_, v)| **v != 0.0 && **v != 1.0)
    {
        return Err(EstimationError::InvalidResponse { row, value });
    }
    Ok(())
}

fn log_layout_info(layout: &ModelLayout, features: &[FeatureSpec]) {
    log::info!(
        "Model layout: {} total coefficients across {} terms.",
        layout.total_coeffs(),
        layout.n_bases.len()
    );
    for (i, feature) in features.iter().enumerate() {
        log::debug!(
            "  feature {}: {:?}, {} knots, order {}, {} bases",
            i + 1,
            feature.kind,
            feature.knots.len(),
            feature.spline_order,
            feature.n_bases()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PerFeature, SolverKind};
    use crate::features::FeatureKind;
    use ndarray::{Array1, Array2, array};

    fn small_problem() -> (Array2<f64>, Array1<f64>) {
        let n = 120;
        let mut x = Array2::zeros((n, 2));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let t = i as f64 / n as f64;
            x[[i, 0]] = 4.0 * t - 2.0;
            x[[i, 1]] = (i % 3) as f64;
            // Deterministic labels with overlap so the optimum is finite.
            y[i] = if (i * 7919) % 10 < (3 + 4 * i / n) { 1.0 } else { 0.0 };
        }
        (x, y)
    }

    #[test]
    fn training_builds_one_block_per_feature() {
        let (x, y) = small_problem();
        let config = GamConfig::default()
            .with_n_knots(PerFeature::Broadcast(4))
            .with_seed(1);
        let (model, report) = train(
            x.view(),
            &[ColumnStorage::Real, ColumnStorage::Integer],
            y.view(),
            &config,
            None,
        )
        .unwrap();

        assert_eq!(model.features[0].kind, FeatureKind::Continuous);
        assert_eq!(model.features[1].kind, FeatureKind::Categorical);
        // intercept, 6 knots at order 4, 3 categories at order 1
        assert_eq!(model.layout.n_bases, vec![1, 8, 3]);
        assert_eq!(model.coefficients.len(), 12);
        assert_eq!(report.iterations, report.logs.len());
        assert!(report.converged());
        assert!(report.aic.is_some() && report.aicc.is_some());
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let x = array![[0.0], [1.0], [2.0]];
        let config = GamConfig::default().with_seed(0);
        let storage = [ColumnStorage::Real];

        let bad_y = array![0.0, 0.5, 1.0];
        assert!(matches!(
            train(x.view(), &storage, bad_y.view(), &config, None),
            Err(EstimationError::InvalidResponse { row: 1, .. })
        ));

        let short_y = array![0.0, 1.0];
        assert!(matches!(
            train(x.view(), &storage, short_y.view(), &config, None),
            Err(EstimationError::DimensionMismatch(_))
        ));

        let y = array![0.0, 1.0, 1.0];
        assert!(matches!(
            train(x.view(), &[], y.view(), &config, None),
            Err(EstimationError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn mismatched_warm_start_falls_back_to_zeros() {
        let (x, y) = small_problem();
        let config = GamConfig::default()
            .with_n_knots(PerFeature::Broadcast(3))
            .with_solver(SolverKind::Direct)
            .with_seed(5);
        let storage = [ColumnStorage::Real, ColumnStorage::Integer];

        let (cold, _) = train(x.view(), &storage, y.view(), &config, None).unwrap();
        let wrong_length = Coefficients::zeros(3);
        let (warm, _) =
            train(x.view(), &storage, y.view(), &config, Some(&wrong_length)).unwrap();
        assert_eq!(cold.coefficients, warm.coefficients);
    }

    #[test]
    fn missing_singular_vectors_have_their_own_error() {
        let message = EstimationError::SvdVectorsMissing.to_string();
        assert!(message.contains("singular vectors"), "{message}");
        assert!(!message.contains("layout"));
    }
}
