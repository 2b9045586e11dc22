#![deny(dead_code)]
#![deny(unused_imports)]

//! Logistic generalized additive models.
//!
//! The log-odds of a binary response are modeled as an intercept plus one
//! penalized B-spline smooth per input column, fitted by penalized iteratively
//! reweighted least squares. Start with [`LogisticGam`] and [`GamConfig`].

pub mod basis;
pub mod config;
pub mod construction;
pub mod data;
pub mod estimate;
pub mod features;
pub mod inference;
pub mod matrix;
pub mod model;
pub mod pirls;
pub mod types;

pub use config::{GamConfig, PenaltySpec, PerFeature, SolverKind};
pub use estimate::{EstimationError, FitReport};
pub use features::{ColumnStorage, FeatureKind};
pub use inference::{IntervalSpec, PartialDependence};
pub use model::{LogisticGam, ModelError, TrainedModel};
