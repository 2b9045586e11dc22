use crate::features::{FeatureKind, unique_sorted};
use crate::matrix::DesignMatrix;
use ndarray::{Array1, Array2, ArrayView1, s};
use thiserror::Error;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline order must be at least 1, but was {0}.")]
    InvalidOrder(usize),

    #[error("A knot vector needs at least two boundary knots, but {0} were given.")]
    TooFewKnots(usize),

    #[error("Quantile knots require a non-empty data column.")]
    QuantileDataMissing,

    #[error("Difference penalty order must be positive, but was {0}.")]
    InvalidPenaltyOrder(usize),

    #[error("Failed to assemble the sparse basis matrix: {0}")]
    SparseAssembly(String),
}

/// Computes the knot vector of one feature, boundaries included when
/// `add_boundaries` is set.
///
/// Categorical features get one knot per category transition, `min - 0.5`
/// followed by every category value `+ 0.5`, so `k` categories always yield
/// `k + 1` knots whatever `n_knots` says. Continuous features get the data
/// quantiles at `n_knots + 2` evenly spaced percentile levels from 0 to 100.
pub fn generate_knots(
    data: ArrayView1<f64>,
    kind: FeatureKind,
    n_knots: usize,
    add_boundaries: bool,
) -> Result<Array1<f64>, BasisError> {
    if data.is_empty() {
        return Err(BasisError::QuantileDataMissing);
    }

    let knots = match kind {
        FeatureKind::Categorical => {
            let categories = unique_sorted(data.iter().copied());
            let mut knots = Vec::with_capacity(categories.len() + 1);
            knots.push(categories[0] - 0.5);
            knots.extend(categories.iter().map(|c| c + 0.5));
            knots
        }
        FeatureKind::Continuous => {
            let levels = n_knots + 2;
            let mut sorted = data.to_vec();
            sorted.sort_unstable_by(|a, b| a.total_cmp(b));
            (0..levels)
                .map(|k| percentile(&sorted, k as f64 / (levels - 1) as f64))
                .collect()
        }
    };

    let knots = Array1::from_vec(knots);
    if add_boundaries {
        Ok(knots)
    } else {
        let last = knots.len() - 1;
        Ok(knots.slice(s![1..last]).to_owned())
    }
}

/// Linear-interpolation percentile of sorted data, `p` in [0, 1].
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let float_idx = (sorted.len() as f64 - 1.0) * p;
    let lower_idx = float_idx.floor() as usize;
    let upper_idx = (float_idx.ceil() as usize).min(sorted.len() - 1);

    if lower_idx == upper_idx {
        sorted[lower_idx]
    } else {
        let fraction = float_idx - lower_idx as f64;
        sorted[lower_idx] * (1.0 - fraction) + sorted[upper_idx] * fraction
    }
}

/// Number of basis functions produced by a knot vector of `num_knots`
/// boundary-inclusive knots at the given spline order.
pub fn num_basis_functions(num_knots: usize, order: usize) -> usize {
    num_knots + order - 2
}

/// Evaluates a B-spline basis with De Boor's recursion.
///
/// `knots` are the feature's boundary-inclusive knots; the outermost knots are
/// repeated `order - 1` extra times on each side before evaluation. Points past
/// the last knot extend the final polynomial piece and points before the first
/// knot extend the first one, so every row still sums to one.
///
/// When `sparse` is set the result is stored in compressed-column form.
pub fn bspline_basis(
    x: ArrayView1<f64>,
    knots: ArrayView1<f64>,
    order: usize,
    sparse: bool,
) -> Result<DesignMatrix, BasisError> {
    let dense = internal::evaluate_basis(x, knots, order)?;
    if sparse {
        DesignMatrix::sparse_from_dense(dense.view())
    } else {
        Ok(DesignMatrix::Dense(dense))
    }
}

/// Default proto-penalty for continuous features: `D'D` where `D` is the
/// `order`-th finite-difference operator over `n` coefficients.
///
/// With `n <= order` there is nothing to difference and the penalty is zero.
pub fn difference_penalty(n: usize, order: usize) -> Result<Array2<f64>, BasisError> {
    if order == 0 {
        return Err(BasisError::InvalidPenaltyOrder(order));
    }
    if n <= order {
        return Ok(Array2::zeros((n, n)));
    }

    let mut d = Array2::<f64>::eye(n);
    for _ in 0..order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }
    Ok(d.t().dot(&d))
}

/// Default proto-penalty for categorical features: a ridge on every level.
pub fn identity_penalty(n: usize) -> Array2<f64> {
    Array2::eye(n)
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Augmented knots: the minimum repeated `order - 1` times, the sorted
    /// knots, then the maximum repeated `order - 1` times.
    pub(super) fn augment_knots(knots: ArrayView1<f64>, order: usize) -> Vec<f64> {
        let mut sorted = knots.to_vec();
        sorted.sort_unstable_by(|a, b| a.total_cmp(b));
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];

        let mut augmented = Vec::with_capacity(sorted.len() + 2 * (order - 1));
        augmented.extend(std::iter::repeat_n(min, order - 1));
        augmented.extend_from_slice(&sorted);
        augmented.extend(std::iter::repeat_n(max, order - 1));
        augmented
    }

    pub(super) fn evaluate_basis(
        x: ArrayView1<f64>,
        knots: ArrayView1<f64>,
        order: usize,
    ) -> Result<Array2<f64>, BasisError> {
        if order < 1 {
            return Err(BasisError::InvalidOrder(order));
        }
        if knots.len() < 2 {
            return Err(BasisError::TooFewKnots(knots.len()));
        }

        let aug = augment_knots(knots, order);
        let num_haar = aug.len() - 1;
        let first = aug[0];
        let last = aug[num_haar];

        // Order-1 indicator bases on [aug_j, aug_{j+1}).
        let mut bases = Array2::<f64>::zeros((x.len(), num_haar));
        for (i, &xi) in x.iter().enumerate() {
            for j in 0..num_haar {
                if xi >= aug[j] && xi < aug[j + 1] {
                    bases[[i, j]] = 1.0;
                }
            }
            if xi >= last {
                bases[[i, num_haar - order]] = 1.0;
            }
            if xi < first {
                bases[[i, order - 1]] = 1.0;
            }
        }

        let mut width = num_haar;
        for m in 2..=order {
            width -= 1;
            let mut next = Array2::<f64>::zeros((x.len(), width));
            for j in 0..width {
                // Repeated knots give zero-width supports; those terms vanish.
                let left_denom = aug[j + m - 1] - aug[j];
                let right_denom = aug[j + m] - aug[j + 1];
                for (i, &xi) in x.iter().enumerate() {
                    let mut value = 0.0;
                    if left_denom != 0.0 {
                        value += (xi - aug[j]) / left_denom * bases[[i, j]];
                    }
                    if right_denom != 0.0 {
                        value += (aug[j + m] - xi) / right_denom * bases[[i, j + 1]];
                    }
                    next[[i, j]] = value;
                }
            }
            bases = next;
        }

        Ok(bases)
    }
}
