use crate::basis::BasisError;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView2};

/// Unified design matrix representation for dense and sparse workflows.
///
/// Spline bases are locally supported, so most entries are zero; the sparse
/// variant stores them in compressed-column form.
#[derive(Clone)]
pub enum DesignMatrix {
    Dense(Array2<f64>),
    Sparse(SparseColMat<usize, f64>),
}

impl DesignMatrix {
    /// Builds a compressed-column matrix from the non-zero entries of `dense`.
    pub fn sparse_from_dense(dense: ArrayView2<f64>) -> Result<Self, BasisError> {
        let triplets: Vec<Triplet<usize, usize, f64>> = dense
            .indexed_iter()
            .filter(|(_, value)| **value != 0.0)
            .map(|((row, col), &value)| Triplet::new(row, col, value))
            .collect();
        Self::from_triplets(dense.nrows(), dense.ncols(), &triplets)
    }

    fn from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[Triplet<usize, usize, f64>],
    ) -> Result<Self, BasisError> {
        SparseColMat::try_new_from_triplets(nrows, ncols, triplets)
            .map(Self::Sparse)
            .map_err(|err| BasisError::SparseAssembly(format!("{err:?}")))
    }

    /// Concatenates blocks horizontally, in order, into one sparse matrix.
    pub fn hstack(blocks: &[DesignMatrix]) -> Result<Self, BasisError> {
        let nrows = blocks.first().map_or(0, DesignMatrix::nrows);
        let mut triplets = Vec::new();
        let mut col_offset = 0;
        for block in blocks {
            if block.nrows() != nrows {
                return Err(BasisError::SparseAssembly(format!(
                    "block has {} rows, expected {nrows}",
                    block.nrows()
                )));
            }
            block.for_each_nonzero(|row, col, value| {
                triplets.push(Triplet::new(row, col_offset + col, value));
            });
            col_offset += block.ncols();
        }
        Self::from_triplets(nrows, col_offset, &triplets)
    }

    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.nrows(),
            Self::Sparse(matrix) => matrix.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.ncols(),
            Self::Sparse(matrix) => matrix.ncols(),
        }
    }

    /// Visits every stored entry as `(row, col, value)`.
    fn for_each_nonzero(&self, mut visit: impl FnMut(usize, usize, f64)) {
        match self {
            Self::Dense(matrix) => {
                for ((row, col), &value) in matrix.indexed_iter() {
                    if value != 0.0 {
                        visit(row, col, value);
                    }
                }
            }
            Self::Sparse(matrix) => {
                let (symbolic, values) = matrix.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();
                for col in 0..matrix.ncols() {
                    for idx in col_ptr[col]..col_ptr[col + 1] {
                        visit(row_idx[idx], col, values[idx]);
                    }
                }
            }
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => matrix.clone(),
            Self::Sparse(_) => {
                let mut dense = Array2::zeros((self.nrows(), self.ncols()));
                self.for_each_nonzero(|row, col, value| dense[[row, col]] = value);
                dense
            }
        }
    }

    pub fn matrix_vector_multiply(&self, vector: &Array1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.dot(vector),
            Self::Sparse(_) => {
                let mut output = Array1::<f64>::zeros(self.nrows());
                self.for_each_nonzero(|row, col, value| output[row] += value * vector[col]);
                output
            }
        }
    }

    /// Dense copy of the selected rows, each scaled by its weight.
    ///
    /// Row `k` of the result is `row_weights[k] * X[rows[k], ..]`.
    pub fn weighted_rows(&self, rows: &[usize], row_weights: &Array1<f64>) -> Array2<f64> {
        let mut position = vec![None; self.nrows()];
        for (k, &row) in rows.iter().enumerate() {
            position[row] = Some(k);
        }
        let mut output = Array2::zeros((rows.len(), self.ncols()));
        self.for_each_nonzero(|row, col, value| {
            if let Some(k) = position[row] {
                output[[k, col]] = row_weights[k] * value;
            }
        });
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn sparse_and_dense_products_agree() {
        let dense = array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0], [4.0, 5.0, 0.0]];
        let sparse = DesignMatrix::sparse_from_dense(dense.view()).unwrap();
        let v = array![1.0, -1.0, 0.5];

        assert_eq!(sparse.to_dense(), dense);
        assert_eq!(sparse.matrix_vector_multiply(&v), dense.dot(&v));
    }

    #[test]
    fn hstack_preserves_column_order() {
        let intercept = DesignMatrix::Dense(array![[1.0], [1.0]]);
        let block = DesignMatrix::sparse_from_dense(array![[0.0, 2.0], [3.0, 0.0]].view()).unwrap();
        let stacked = DesignMatrix::hstack(&[intercept, block]).unwrap();

        assert_eq!(stacked.ncols(), 3);
        assert_eq!(stacked.to_dense(), array![[1.0, 0.0, 2.0], [1.0, 3.0, 0.0]]);
    }

    #[test]
    fn weighted_rows_selects_and_scales() {
        let matrix = DesignMatrix::sparse_from_dense(
            array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]].view(),
        )
        .unwrap();
        let rows = [0, 2];
        let weights = array![2.0, 0.5];
        assert_eq!(
            matrix.weighted_rows(&rows, &weights),
            array![[2.0, 4.0], [2.5, 3.0]]
        );
    }
}
