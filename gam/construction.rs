use crate::basis::{self, BasisError, bspline_basis, difference_penalty, identity_penalty};
use crate::config::PenaltySpec;
use crate::features::FeatureKind;
use crate::matrix::DesignMatrix;
use ndarray::{Array1, Array2, ArrayView2, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Underlying basis function generation failed: {0}")]
    BasisError(#[from] BasisError),

    #[error("Feature index {index} is out of range; valid indices are -1 (all), 0 (intercept) and 1..={num_features}.")]
    FeatureOutOfRange { index: isize, num_features: usize },

    #[error("Data has {found} feature columns, but the model was built for {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },

    #[error(
        "Custom penalty for term {term} must be a {expected}x{expected} matrix, but it returned {rows}x{cols}."
    )]
    InvalidCustomPenalty {
        term: usize,
        expected: usize,
        rows: usize,
        cols: usize,
    },
}

/// Everything needed to rebuild one feature's basis block on new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub kind: FeatureKind,
    /// Boundary-inclusive knots derived from the training column.
    pub knots: Array1<f64>,
    /// Degree + 1.
    pub spline_order: usize,
}

impl FeatureSpec {
    pub fn n_bases(&self) -> usize {
        basis::num_basis_functions(self.knots.len(), self.spline_order)
    }
}

/// Column layout of the design matrix: the intercept first, then one
/// contiguous block per feature in input column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLayout {
    /// Basis count per term; entry 0 is the intercept.
    pub n_bases: Vec<usize>,
}

impl ModelLayout {
    pub fn from_features(features: &[FeatureSpec]) -> Self {
        let mut n_bases = Vec::with_capacity(features.len() + 1);
        n_bases.push(1);
        n_bases.extend(features.iter().map(FeatureSpec::n_bases));
        Self { n_bases }
    }

    pub fn total_coeffs(&self) -> usize {
        self.n_bases.iter().sum()
    }

    /// Number of features, not counting the intercept.
    pub fn num_features(&self) -> usize {
        self.n_bases.len() - 1
    }

    /// Coefficient columns owned by a term: `-1` selects everything, `0` the
    /// intercept and `i >= 1` the `i`-th feature.
    pub fn select(&self, index: isize) -> Result<Range<usize>, LayoutError> {
        if index < -1 || index >= self.n_bases.len() as isize {
            return Err(LayoutError::FeatureOutOfRange {
                index,
                num_features: self.num_features(),
            });
        }
        if index == -1 {
            return Ok(0..self.total_coeffs());
        }

        let term = index as usize;
        let start: usize = self.n_bases[..term].iter().sum();
        Ok(start..start + self.n_bases[term])
    }
}

/// Builds the basis matrix for a term of the model: `-1` stacks the intercept
/// column and every feature block, `0` is the intercept column alone and
/// `i >= 1` is the `i`-th feature's block.
pub fn build_bases(
    x: ArrayView2<f64>,
    features: &[FeatureSpec],
    index: isize,
) -> Result<DesignMatrix, LayoutError> {
    if x.ncols() != features.len() {
        return Err(LayoutError::MismatchedFeatureCount {
            found: x.ncols(),
            expected: features.len(),
        });
    }
    if index < -1 || index > features.len() as isize {
        return Err(LayoutError::FeatureOutOfRange {
            index,
            num_features: features.len(),
        });
    }

    let intercept = || DesignMatrix::Dense(Array2::ones((x.nrows(), 1)));
    let feature_block = |i: usize| {
        let spec = &features[i];
        bspline_basis(x.column(i), spec.knots.view(), spec.spline_order, true)
    };

    match index {
        -1 => {
            let mut blocks = Vec::with_capacity(features.len() + 1);
            blocks.push(intercept());
            for i in 0..features.len() {
                blocks.push(feature_block(i)?);
            }
            Ok(DesignMatrix::hstack(&blocks)?)
        }
        0 => Ok(intercept()),
        i => Ok(feature_block(i as usize - 1)?),
    }
}

/// Block-diagonal penalty with one block per term, each already scaled by its
/// smoothing parameter.
#[derive(Debug, Clone)]
pub struct PenaltyMatrix {
    blocks: Vec<Array2<f64>>,
}

impl PenaltyMatrix {
    /// Assembles `blockdiag(lam_0 P_0, lam_1 P_1, ...)`.
    ///
    /// `penalties` and `lambdas` carry one entry per term including the
    /// intercept; the intercept block is always zero.
    pub fn assemble(
        layout: &ModelLayout,
        penalties: &[PenaltySpec],
        kinds: &[FeatureKind],
        lambdas: &[f64],
    ) -> Result<Self, LayoutError> {
        let mut blocks = Vec::with_capacity(layout.n_bases.len());
        blocks.push(Array2::zeros((1, 1)));

        for (term, &n) in layout.n_bases.iter().enumerate().skip(1) {
            let proto = proto_penalty(&penalties[term], n, kinds[term - 1], term)?;
            blocks.push(proto * lambdas[term]);
        }
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[Array2<f64>] {
        &self.blocks
    }

    pub fn dim(&self) -> usize {
        self.blocks.iter().map(Array2::nrows).sum()
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let dim = self.dim();
        let mut dense = Array2::zeros((dim, dim));
        let mut offset = 0;
        for block in &self.blocks {
            let n = block.nrows();
            dense
                .slice_mut(s![offset..offset + n, offset..offset + n])
                .assign(block);
            offset += n;
        }
        dense
    }
}

/// Unscaled penalty for one term with `n` basis functions.
pub fn proto_penalty(
    spec: &PenaltySpec,
    n: usize,
    kind: FeatureKind,
    term: usize,
) -> Result<Array2<f64>, LayoutError> {
    let matrix = match spec {
        PenaltySpec::Auto => match kind {
            FeatureKind::Continuous => difference_penalty(n, 1)?,
            FeatureKind::Categorical => identity_penalty(n),
        },
        PenaltySpec::Difference { order } => difference_penalty(n, *order)?,
        PenaltySpec::Identity => identity_penalty(n),
        PenaltySpec::Custom(build) => {
            let matrix = build(n);
            if matrix.nrows() != n || matrix.ncols() != n {
                return Err(LayoutError::InvalidCustomPenalty {
                    term,
                    expected: n,
                    rows: matrix.nrows(),
                    cols: matrix.ncols(),
                });
            }
            matrix
        }
    };
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, array};

    fn continuous(knots: Array1<f64>) -> FeatureSpec {
        FeatureSpec {
            kind: FeatureKind::Continuous,
            knots,
            spline_order: 4,
        }
    }

    fn categorical(levels: usize) -> FeatureSpec {
        FeatureSpec {
            kind: FeatureKind::Categorical,
            knots: Array::range(-0.5, levels as f64, 1.0),
            spline_order: 1,
        }
    }

    #[test]
    fn feature_ranges_partition_the_columns() {
        let features = vec![continuous(Array::linspace(0.0, 1.0, 6)), categorical(3)];
        let layout = ModelLayout::from_features(&features);
        assert_eq!(layout.n_bases, vec![1, 8, 3]);
        assert_eq!(layout.select(-1).unwrap(), 0..12);

        let mut covered = Vec::new();
        for i in 0..=layout.num_features() as isize {
            covered.extend(layout.select(i).unwrap());
        }
        assert_eq!(covered, (0..12).collect::<Vec<_>>());
        assert_eq!(layout.select(0).unwrap(), 0..1);
        assert_eq!(layout.select(2).unwrap(), 9..12);
    }

    #[test]
    fn out_of_range_selection_is_rejected() {
        let layout = ModelLayout::from_features(&[categorical(2)]);
        assert!(matches!(
            layout.select(2),
            Err(LayoutError::FeatureOutOfRange { index: 2, num_features: 1 })
        ));
        assert!(layout.select(-2).is_err());
    }

    #[test]
    fn design_matrix_has_intercept_then_blocks() {
        let features = vec![categorical(3), continuous(Array::linspace(0.0, 1.0, 4))];
        let x = array![[0.0, 0.1], [1.0, 0.5], [2.0, 0.9]];
        let design = build_bases(x.view(), &features, -1).unwrap().to_dense();
        let layout = ModelLayout::from_features(&features);

        assert_eq!(design.ncols(), layout.total_coeffs());
        assert!(design.column(0).iter().all(|&v| v == 1.0));
        assert_eq!(design.slice(s![.., 1..4]), Array2::<f64>::eye(3));

        let block = build_bases(x.view(), &features, 2).unwrap().to_dense();
        assert_eq!(block, design.slice(s![.., 4..]).to_owned());
    }

    #[test]
    fn penalty_is_block_diagonal_with_free_intercept() {
        let features = vec![continuous(Array::linspace(0.0, 1.0, 3)), categorical(2)];
        let layout = ModelLayout::from_features(&features);
        let kinds: Vec<FeatureKind> = features.iter().map(|f| f.kind).collect();
        let penalties = vec![PenaltySpec::Auto; 3];
        let lambdas = [5.0, 2.0, 3.0];

        let penalty = PenaltyMatrix::assemble(&layout, &penalties, &kinds, &lambdas).unwrap();
        assert_eq!(penalty.blocks().len(), 1 + features.len());
        assert_eq!(penalty.blocks()[0], array![[0.0]]);
        assert_eq!(penalty.blocks()[2], Array2::<f64>::eye(2) * 3.0);

        let dense = penalty.to_dense();
        assert_eq!(dense.nrows(), layout.total_coeffs());
        assert_eq!(dense, dense.t());
        // Nothing couples the continuous block (cols 1..6) with the categorical one.
        assert!(dense.slice(s![1..6, 6..]).iter().all(|&v| v == 0.0));
        assert!(dense.row(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn custom_penalty_shape_is_checked() {
        let layout = ModelLayout::from_features(&[categorical(3)]);
        let bad = PenaltySpec::custom(|n| Array2::eye(n + 1));
        let err = PenaltyMatrix::assemble(
            &layout,
            &[PenaltySpec::Auto, bad],
            &[FeatureKind::Categorical],
            &[0.0, 1.0],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LayoutError::InvalidCustomPenalty { term: 1, expected: 3, rows: 4, cols: 4 }
        ));
    }
}
