//! # Model Configuration
//!
//! `GamConfig` is the user-facing, immutable description of a model. Per-feature
//! knobs are either broadcast to every feature or given as an explicit list, and
//! are resolved exactly once per fit into fixed-length vectors by
//! [`GamConfig::resolve`].

use crate::features::FeatureKind;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A value shared by all features, or one value per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PerFeature<T> {
    Broadcast(T),
    PerFeature(Vec<T>),
}

impl<T: Clone> PerFeature<T> {
    /// Expands to exactly `n` values. Broadcast values pass through
    /// `categorical_override` for categorical features.
    fn expand(
        &self,
        name: &'static str,
        kinds: &[FeatureKind],
        categorical_override: impl Fn(&T) -> T,
    ) -> Result<Vec<T>, ConfigError> {
        match self {
            Self::Broadcast(value) => Ok(kinds
                .iter()
                .map(|kind| match kind {
                    FeatureKind::Categorical => categorical_override(value),
                    FeatureKind::Continuous => value.clone(),
                })
                .collect()),
            Self::PerFeature(values) if values.len() == kinds.len() => Ok(values.clone()),
            Self::PerFeature(values) => Err(ConfigError::LengthMismatch {
                name,
                expected: kinds.len(),
                found: values.len(),
            }),
        }
    }
}

/// Builds a square proto-penalty for a given number of basis functions.
pub type PenaltyFn = Arc<dyn Fn(usize) -> Array2<f64> + Send + Sync>;

/// Rule producing a feature's unscaled penalty matrix.
#[derive(Clone)]
pub enum PenaltySpec {
    /// First-order difference penalty for continuous features, ridge for
    /// categorical ones.
    Auto,
    /// Difference penalty of the given order.
    Difference { order: usize },
    /// Ridge penalty.
    Identity,
    /// User supplied; must return a symmetric PSD `n x n` matrix.
    Custom(PenaltyFn),
}

impl PenaltySpec {
    pub fn custom(build: impl Fn(usize) -> Array2<f64> + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(build))
    }
}

impl fmt::Debug for PenaltySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "Auto"),
            Self::Difference { order } => write!(f, "Difference {{ order: {order} }}"),
            Self::Identity => write!(f, "Identity"),
            Self::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

/// Numerical strategy for each penalized weighted least-squares step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverKind {
    /// QR of the weighted design, SVD of `[R; E']` with rank truncation.
    Stable,
    /// Direct inverse of `X'WX + P`.
    Direct,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{name} must have the same length as the number of features: expected {expected}, found {found}.")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("lam must be finite and >= 0, but feature {feature} has {value}.")]
    InvalidLambda { feature: usize, value: f64 },

    #[error("spline_order must be >= 1, but feature {feature} has {value}.")]
    InvalidSplineOrder { feature: usize, value: usize },

    #[error("n_iter must be >= 1.")]
    InvalidIterationCount,

    #[error("tol must be finite and > 0, but was {0}.")]
    InvalidTolerance(f64),
}

#[derive(Debug, Clone)]
pub struct GamConfig {
    /// Smoothing strength.
    pub lam: PerFeature<f64>,
    /// Interior knots for continuous features.
    pub n_knots: PerFeature<usize>,
    /// Spline order (degree + 1).
    pub spline_order: PerFeature<usize>,
    pub penalty: PerFeature<PenaltySpec>,
    /// Maximum number of IRLS iterations.
    pub n_iter: usize,
    /// Convergence threshold on the relative coefficient change.
    pub tol: f64,
    pub solver: SolverKind,
    /// Seed for the randomized parts of a fit (feature typing jitter and the
    /// effective degrees of freedom estimator). `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for GamConfig {
    fn default() -> Self {
        Self {
            lam: PerFeature::Broadcast(0.6),
            n_knots: PerFeature::Broadcast(20),
            spline_order: PerFeature::Broadcast(4),
            penalty: PerFeature::Broadcast(PenaltySpec::Auto),
            n_iter: 100,
            tol: 1e-5,
            solver: SolverKind::Stable,
            seed: None,
        }
    }
}

impl GamConfig {
    pub fn with_lam(mut self, lam: PerFeature<f64>) -> Self {
        self.lam = lam;
        self
    }

    pub fn with_n_knots(mut self, n_knots: PerFeature<usize>) -> Self {
        self.n_knots = n_knots;
        self
    }

    pub fn with_spline_order(mut self, spline_order: PerFeature<usize>) -> Self {
        self.spline_order = spline_order;
        self
    }

    pub fn with_penalty(mut self, penalty: PerFeature<PenaltySpec>) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_solver(mut self, solver: SolverKind) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Validates the scalar settings and expands every per-feature setting.
    pub fn resolve(&self, kinds: &[FeatureKind]) -> Result<ResolvedConfig, ConfigError> {
        if self.n_iter < 1 {
            return Err(ConfigError::InvalidIterationCount);
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(ConfigError::InvalidTolerance(self.tol));
        }

        let feature_lambdas = self.lam.expand("lam", kinds, |&lam| lam)?;
        if let Some((feature, &value)) = feature_lambdas
            .iter()
            .enumerate()
            .find(|(_, lam)| !lam.is_finite() || **lam < 0.0)
        {
            return Err(ConfigError::InvalidLambda { feature, value });
        }

        let n_knots = self.n_knots.expand("n_knots", kinds, |_| 0)?;

        let spline_orders = self.spline_order.expand("spline_order", kinds, |_| 1)?;
        if let Some((feature, &value)) =
            spline_orders.iter().enumerate().find(|(_, order)| **order < 1)
        {
            return Err(ConfigError::InvalidSplineOrder { feature, value });
        }

        let feature_penalties = self.penalty.expand("penalty_matrix", kinds, Clone::clone)?;

        // Term 0 is the intercept: unpenalized, with a zero proto-penalty.
        let mut lambdas = Vec::with_capacity(kinds.len() + 1);
        lambdas.push(0.0);
        lambdas.extend(feature_lambdas);

        let mut penalties = Vec::with_capacity(kinds.len() + 1);
        penalties.push(PenaltySpec::Auto);
        penalties.extend(feature_penalties);

        Ok(ResolvedConfig {
            lambdas,
            n_knots,
            spline_orders,
            penalties,
        })
    }
}

/// Per-feature settings expanded to fixed length for one fit.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// One per term, intercept first (always 0).
    pub lambdas: Vec<f64>,
    /// One per feature.
    pub n_knots: Vec<usize>,
    /// One per feature.
    pub spline_orders: Vec<usize>,
    /// One per term, intercept first.
    pub penalties: Vec<PenaltySpec>,
}
