use crate::config::SolverKind;
use crate::construction::PenaltyMatrix;
use crate::estimate::EstimationError;
use crate::matrix::DesignMatrix;
use crate::types::{Coefficients, sigmoid};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use ndarray_linalg::{Cholesky, Inverse, QR, SVD, UPLO};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// `sqrt(f64::EPSILON)`.
pub const SQRT_EPSILON: f64 = 1.490_116_119_384_765_6e-8;

/// Ridge added to the penalty diagonal before factorization.
pub const PENALTY_CONDITIONING_RIDGE: f64 = SQRT_EPSILON;

/// Singular values at or below `max(d) * SINGULAR_VALUE_RTOL` are discarded.
pub const SINGULAR_VALUE_RTOL: f64 = SQRT_EPSILON;

/// Upper bound on the number of observations sampled by the EDOF estimator.
pub const EDOF_MAX_SAMPLES: usize = 5000;

/// Dispersion of the binomial family.
pub const BINOMIAL_SCALE: f64 = 1.0;

/// The status of the P-IRLS convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PirlsStatus {
    /// Relative coefficient change fell below the tolerance.
    Converged,
    /// Reached maximum iterations without converging.
    MaxIterationsReached,
}

/// Diagnostics recorded at every iteration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationLog {
    /// Training accuracy on unmasked rows, before the update.
    pub accuracy: f64,
    /// Negative log-likelihood on unmasked rows, before the update.
    pub neg_log_likelihood: f64,
    /// `|b_old - b_new| / |b_new|`.
    pub coefficient_change: f64,
}

/// Uncertainty of a converged fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitStatistics {
    pub edof: f64,
    pub scale: f64,
    pub covariance: Array2<f64>,
    pub standard_errors: Array1<f64>,
}

pub struct PirlsResult {
    pub beta: Coefficients,
    pub status: PirlsStatus,
    pub logs: Vec<IterationLog>,
    /// Only present when the loop converged.
    pub statistics: Option<FitStatistics>,
}

/// One penalized weighted least-squares solve.
pub struct PlsSolution {
    pub beta: Array1<f64>,
    /// `W X` over the unmasked rows, `n x m`.
    pub weighted_design: Array2<f64>,
    /// Matrix `B` (`m x n`) with `beta = B (W z)`.
    pub pseudo_inverse: Array2<f64>,
    /// Singular values kept by the solve; `m` when nothing was truncated.
    pub rank: usize,
}

/// Minimizes `|W (z - X b)|^2 + b' P b` for one IRLS step.
pub trait PenalizedLeastSquares {
    /// `rows` selects the unmasked observations; `sqrt_weights` and
    /// `pseudo_data` are aligned with `rows`.
    fn solve(
        &self,
        design: &DesignMatrix,
        rows: &[usize],
        sqrt_weights: &Array1<f64>,
        pseudo_data: &Array1<f64>,
    ) -> Result<PlsSolution, EstimationError>;
}

/// QR of `W X`, then SVD of `[R; E']` with `P = E E'`.
pub struct StableSolver {
    penalty_root_t: Array2<f64>,
}

impl StableSolver {
    pub fn new(penalty: &Array2<f64>) -> Result<Self, EstimationError> {
        let lower = penalty
            .cholesky(UPLO::Lower)
            .map_err(EstimationError::LinearSystemSolveFailed)?;
        Ok(Self {
            penalty_root_t: lower.t().to_owned(),
        })
    }
}

impl PenalizedLeastSquares for StableSolver {
    fn solve(
        &self,
        design: &DesignMatrix,
        rows: &[usize],
        sqrt_weights: &Array1<f64>,
        pseudo_data: &Array1<f64>,
    ) -> Result<PlsSolution, EstimationError> {
        let m = design.ncols();
        let wx = design.weighted_rows(rows, sqrt_weights);
        let wz = sqrt_weights * pseudo_data;

        let (q, r) = wx.qr().map_err(EstimationError::LinearSystemSolveFailed)?;
        let k = r.nrows();

        let mut stacked = Array2::<f64>::zeros((k + m, m));
        stacked.slice_mut(s![..k, ..]).assign(&r);
        stacked.slice_mut(s![k.., ..]).assign(&self.penalty_root_t);

        let (u, d, vt) = stacked
            .svd(true, true)
            .map_err(EstimationError::LinearSystemSolveFailed)?;
        let (u, vt) = match (u, vt) {
            (Some(u), Some(vt)) => (u, vt),
            _ => return Err(EstimationError::SvdVectorsMissing),
        };

        let d_max = d.iter().copied().fold(0.0_f64, f64::max);
        let cutoff = d_max * SINGULAR_VALUE_RTOL;
        let d_inv = d.mapv(|value| if value > cutoff { value.recip() } else { 0.0 });
        let rank = d_inv.iter().filter(|v| **v != 0.0).count();
        let truncated = d.len() - rank;
        if truncated > 0 {
            log::debug!("Truncated {truncated} singular values below {cutoff:.3e}");
        }

        // B = V D^-1 U1' Q' with U1 the top k rows of U.
        let u1 = u.slice(s![..k, ..m]);
        let v_dinv = &vt.t() * &d_inv.view().insert_axis(Axis(0));
        let pseudo_inverse = v_dinv.dot(&u1.t()).dot(&q.t());
        let beta = pseudo_inverse.dot(&wz);

        Ok(PlsSolution {
            beta,
            weighted_design: wx,
            pseudo_inverse,
            rank,
        })
    }
}

/// Forms and inverts `X'W^2X + P` directly.
pub struct DirectSolver {
    penalty: Array2<f64>,
}

impl DirectSolver {
    pub fn new(penalty: Array2<f64>) -> Self {
        Self { penalty }
    }
}

impl PenalizedLeastSquares for DirectSolver {
    fn solve(
        &self,
        design: &DesignMatrix,
        rows: &[usize],
        sqrt_weights: &Array1<f64>,
        pseudo_data: &Array1<f64>,
    ) -> Result<PlsSolution, EstimationError> {
        let wx = design.weighted_rows(rows, sqrt_weights);
        let wz = sqrt_weights * pseudo_data;

        let hessian = wx.t().dot(&wx) + &self.penalty;
        let inner = hessian
            .inv()
            .map_err(EstimationError::LinearSystemSolveFailed)?;
        let pseudo_inverse = inner.dot(&wx.t());
        let beta = pseudo_inverse.dot(&wz);

        Ok(PlsSolution {
            beta,
            weighted_design: wx,
            pseudo_inverse,
            rank: design.ncols(),
        })
    }
}

fn build_solver(
    kind: SolverKind,
    penalty: Array2<f64>,
) -> Result<Box<dyn PenalizedLeastSquares>, EstimationError> {
    Ok(match kind {
        SolverKind::Stable => Box::new(StableSolver::new(&penalty)?),
        SolverKind::Direct => Box::new(DirectSolver::new(penalty)),
    })
}

/// Fits the coefficients by penalized IRLS, starting from `initial`.
///
/// Running out of iterations is not an error: the last coefficients are kept
/// and the result carries `MaxIterationsReached` without statistics.
pub fn fit_pirls<R: Rng + ?Sized>(
    design: &DesignMatrix,
    y: ArrayView1<f64>,
    penalty: &PenaltyMatrix,
    solver_kind: SolverKind,
    n_iter: usize,
    tol: f64,
    initial: Coefficients,
    rng: &mut R,
) -> Result<PirlsResult, EstimationError> {
    let m = design.ncols();
    let mut stabilized = penalty.to_dense();
    stabilized.diag_mut().mapv_inplace(|v| v + PENALTY_CONDITIONING_RIDGE);
    let solver = build_solver(solver_kind, stabilized)?;

    log::info!(
        "Starting P-IRLS with {} observations, {} coefficients, {:?} solver",
        design.nrows(),
        m,
        solver_kind
    );

    let mut beta = initial;
    let mut logs = Vec::with_capacity(n_iter);

    for iter in 1..=n_iter {
        let log_odds = design.matrix_vector_multiply(&beta);
        let proba = log_odds.mapv(sigmoid);
        let rows = unsaturated_rows(&proba)?;

        let p = proba.select(Axis(0), &rows);
        let eta = log_odds.select(Axis(0), &rows);
        let y_kept = y.select(Axis(0), &rows);

        let accuracy = accuracy(y_kept.view(), p.view());
        let neg_log_likelihood = -log_likelihood(y_kept.view(), p.view());

        let variance = &p * &(1.0 - &p);
        let sqrt_weights = variance.mapv(f64::sqrt);
        let pseudo_data = &eta + &((&y_kept - &p) / &variance);

        let solution = solver.solve(design, &rows, &sqrt_weights, &pseudo_data)?;
        let coefficient_change = l2_norm(&(&*beta - &solution.beta)) / l2_norm(&solution.beta);

        log::debug!(
            "[P-IRLS Iter #{iter}] accuracy: {accuracy:.4}, nll: {neg_log_likelihood:.6e}, change: {coefficient_change:.3e}, masked: {}",
            design.nrows() - rows.len()
        );
        logs.push(IterationLog {
            accuracy,
            neg_log_likelihood,
            coefficient_change,
        });
        beta = Coefficients::new(solution.beta.clone());

        if coefficient_change < tol {
            let edof = estimate_edof(&solution.weighted_design, &solution.pseudo_inverse, rng);
            let scale = BINOMIAL_SCALE;
            let covariance = solution.pseudo_inverse.dot(&solution.pseudo_inverse.t()) * scale;
            let standard_errors = covariance.diag().mapv(f64::sqrt);
            log::info!("P-IRLS converged after {iter} iterations (edof {edof:.3})");

            return Ok(PirlsResult {
                beta,
                status: PirlsStatus::Converged,
                logs,
                statistics: Some(FitStatistics {
                    edof,
                    scale,
                    covariance,
                    standard_errors,
                }),
            });
        }
    }

    log::warn!("P-IRLS did not converge after {n_iter} iterations.");
    Ok(PirlsResult {
        beta,
        status: PirlsStatus::MaxIterationsReached,
        logs,
        statistics: None,
    })
}

/// Rows whose probability is not exactly 0 or 1.
fn unsaturated_rows(proba: &Array1<f64>) -> Result<Vec<usize>, EstimationError> {
    let rows: Vec<usize> = proba
        .iter()
        .enumerate()
        .filter(|(_, p)| **p != 0.0 && **p != 1.0)
        .map(|(i, _)| i)
        .collect();
    if rows.is_empty() {
        return Err(EstimationError::ProbabilitiesSaturated);
    }
    Ok(rows)
}

/// Stochastic trace of the hat matrix `(W X) B`.
///
/// Samples `min(EDOF_MAX_SAMPLES, n)` diagonal positions without replacement
/// and rescales the partial trace by `n / samples`.
pub fn estimate_edof<R: Rng + ?Sized>(
    weighted_design: &Array2<f64>,
    pseudo_inverse: &Array2<f64>,
    rng: &mut R,
) -> f64 {
    let size = weighted_design.nrows();
    let samples = EDOF_MAX_SAMPLES.min(size);
    if samples == 0 {
        return 0.0;
    }
    let trace: f64 = rand::seq::index::sample(rng, size, samples)
        .into_iter()
        .map(|i| weighted_design.row(i).dot(&pseudo_inverse.column(i)))
        .sum();
    trace * size as f64 / samples as f64
}

pub fn accuracy(y: ArrayView1<f64>, proba: ArrayView1<f64>) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    let hits = y
        .iter()
        .zip(proba.iter())
        .filter(|(yi, pi)| (**pi > 0.5) == (**yi == 1.0))
        .count();
    hits as f64 / y.len() as f64
}

pub fn log_likelihood(y: ArrayView1<f64>, proba: ArrayView1<f64>) -> f64 {
    y.iter()
        .zip(proba.iter())
        .map(|(&yi, &pi)| yi * pi.ln() + (1.0 - yi) * (1.0 - pi).ln())
        .sum()
}

fn l2_norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PenaltySpec;
    use crate::construction::{FeatureSpec, ModelLayout, build_bases};
    use crate::features::FeatureKind;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    struct Problem {
        design: DesignMatrix,
        y: Array1<f64>,
        penalty: PenaltyMatrix,
    }

    fn simulated_problem(n: usize, lam: f64) -> Problem {
        let mut rng = StdRng::seed_from_u64(42);
        let x = Array::linspace(-2.0, 2.0, n).insert_axis(Axis(1));
        let y = x.column(0).mapv(|xi| {
            let p = sigmoid(1.5 * xi - 0.5);
            if rng.gen_bool(p) { 1.0 } else { 0.0 }
        });
        let features = vec![FeatureSpec {
            kind: FeatureKind::Continuous,
            knots: Array::linspace(-2.0, 2.0, 7),
            spline_order: 4,
        }];
        let layout = ModelLayout::from_features(&features);
        let design = build_bases(x.view(), &features, -1).unwrap();
        let penalty = PenaltyMatrix::assemble(
            &layout,
            &[PenaltySpec::Auto, PenaltySpec::Auto],
            &[FeatureKind::Continuous],
            &[0.0, lam],
        )
        .unwrap();
        Problem { design, y, penalty }
    }

    fn run(problem: &Problem, kind: SolverKind) -> PirlsResult {
        let mut rng = StdRng::seed_from_u64(0);
        fit_pirls(
            &problem.design,
            problem.y.view(),
            &problem.penalty,
            kind,
            100,
            1e-8,
            Coefficients::zeros(problem.design.ncols()),
            &mut rng,
        )
        .unwrap()
    }

    #[test]
    fn stable_and_direct_solvers_agree() {
        let problem = simulated_problem(400, 0.6);
        let stable = run(&problem, SolverKind::Stable);
        let direct = run(&problem, SolverKind::Direct);

        assert_eq!(stable.status, PirlsStatus::Converged);
        assert_eq!(direct.status, PirlsStatus::Converged);
        for (a, b) in stable.beta.iter().zip(direct.beta.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }

        let cov_stable = &stable.statistics.as_ref().unwrap().covariance;
        let cov_direct = &direct.statistics.as_ref().unwrap().covariance;
        assert!(cov_stable.abs_diff_eq(cov_direct, 1e-4));
    }

    #[test]
    fn converged_fit_reports_consistent_statistics() {
        let problem = simulated_problem(300, 1.0);
        let result = run(&problem, SolverKind::Stable);
        let stats = result.statistics.expect("converged fits carry statistics");

        let m = problem.design.ncols();
        assert_eq!(stats.covariance.dim(), (m, m));
        assert_eq!(stats.scale, 1.0);
        for i in 0..m {
            assert_abs_diff_eq!(stats.standard_errors[i], stats.covariance[[i, i]].sqrt());
        }
        // All 300 rows are sampled, so the estimate is the exact hat trace,
        // bounded by the number of coefficients.
        assert!(stats.edof > 1.0 && stats.edof <= m as f64 + 1e-8, "edof = {}", stats.edof);

        let last = result.logs.last().unwrap();
        assert!(last.coefficient_change < 1e-8);
        assert!(result.logs.len() >= 2);
        assert!(result.logs.iter().all(|l| l.accuracy.is_finite()));
    }

    #[test]
    fn exhausting_iterations_keeps_last_coefficients() {
        let problem = simulated_problem(200, 0.6);
        let mut rng = StdRng::seed_from_u64(0);
        let result = fit_pirls(
            &problem.design,
            problem.y.view(),
            &problem.penalty,
            SolverKind::Stable,
            1,
            1e-12,
            Coefficients::zeros(problem.design.ncols()),
            &mut rng,
        )
        .unwrap();

        assert_eq!(result.status, PirlsStatus::MaxIterationsReached);
        assert!(result.statistics.is_none());
        assert_eq!(result.logs.len(), 1);
        assert!(result.beta.iter().any(|&b| b != 0.0));
    }

    #[test]
    fn saturated_probabilities_are_fatal() {
        let problem = simulated_problem(50, 0.6);
        let mut start = Coefficients::zeros(problem.design.ncols());
        start[0] = 1000.0;
        let mut rng = StdRng::seed_from_u64(0);
        let result = fit_pirls(
            &problem.design,
            problem.y.view(),
            &problem.penalty,
            SolverKind::Direct,
            10,
            1e-6,
            start,
            &mut rng,
        );
        assert!(matches!(result, Err(EstimationError::ProbabilitiesSaturated)));
    }

    #[test]
    fn stable_solver_drops_directions_hidden_by_the_ridge() {
        // Two identical, large columns: the difference direction is only seen
        // through the ridge, whose root falls below `max(d) * rtol`.
        let column = array![1.0, 2.0, -1.0, 0.5] * 1e4;
        let mut dense = Array2::zeros((4, 2));
        dense.column_mut(0).assign(&column);
        dense.column_mut(1).assign(&column);
        let design = DesignMatrix::sparse_from_dense(dense.view()).unwrap();
        let ridge = Array2::eye(2) * PENALTY_CONDITIONING_RIDGE;
        let solver = StableSolver::new(&ridge).unwrap();

        let rows: Vec<usize> = (0..4).collect();
        let weights = Array1::ones(4);
        let z = array![1.0, 0.0, 2.0, -1.0];
        let solution = solver.solve(&design, &rows, &weights, &z).unwrap();
        assert_eq!(solution.rank, 1);

        // Minimum-norm least squares splits the shared slope evenly.
        let shared = column.dot(&z) / (2.0 * column.dot(&column));
        let tolerance = 1e-8 * shared.abs();
        assert_abs_diff_eq!(solution.beta[0], shared, epsilon = tolerance);
        assert_abs_diff_eq!(solution.beta[1], shared, epsilon = tolerance);
    }

    #[test]
    fn edof_subsampling_is_exact_for_small_problems() {
        let wx = array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]];
        let b = array![[0.5, 0.0, 0.1], [0.0, 0.25, 0.2]];
        let exact = wx.dot(&b).diag().sum();
        let mut rng = StdRng::seed_from_u64(9);
        assert_abs_diff_eq!(estimate_edof(&wx, &b, &mut rng), exact, epsilon = 1e-12);
    }

    #[test]
    fn likelihood_and_accuracy_helpers() {
        let y = array![1.0, 0.0, 1.0, 0.0];
        let p = array![0.9, 0.2, 0.4, 0.6];
        assert_abs_diff_eq!(accuracy(y.view(), p.view()), 0.5);
        let expected = 0.9_f64.ln() + 0.8_f64.ln() + 0.4_f64.ln() + 0.4_f64.ln();
        assert_abs_diff_eq!(log_likelihood(y.view(), p.view()), expected, epsilon = 1e-12);
    }
}
