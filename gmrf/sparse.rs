//! Sparse CSC helpers on top of `faer`.
//!
//! Matrices are assembled through a [`TripletAccumulator`] so that repeated
//! contributions to one position are summed before faer sees them. Symmetric
//! systems are handed to the sparse Cholesky as their upper triangle only.

use crate::faer_ndarray::FaerColView;
use faer::Side;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::Llt as SparseLlt;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SparseError {
    #[error("failed to assemble a {nrows}x{ncols} sparse matrix from {nnz} triplets")]
    Assembly { nrows: usize, ncols: usize, nnz: usize },
    #[error("sparse Cholesky factorization failed: matrix of dimension {dim} is not positive definite")]
    NotPositiveDefinite { dim: usize },
}

/// Collects `(row, col, value)` contributions, summing duplicates.
#[derive(Debug, Clone)]
pub struct TripletAccumulator {
    nrows: usize,
    ncols: usize,
    entries: BTreeMap<(usize, usize), f64>,
}

impl TripletAccumulator {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            entries: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        debug_assert!(row < self.nrows && col < self.ncols);
        *self.entries.entry((row, col)).or_insert(0.0) += value;
    }

    pub fn into_csc(self) -> Result<SparseColMat<usize, f64>, SparseError> {
        let triplets: Vec<Triplet<usize, usize, f64>> = self
            .entries
            .iter()
            .filter(|&(_, &value)| value != 0.0)
            .map(|(&(row, col), &value)| Triplet::new(row, col, value))
            .collect();
        SparseColMat::try_new_from_triplets(self.nrows, self.ncols, &triplets).map_err(|_| {
            SparseError::Assembly {
                nrows: self.nrows,
                ncols: self.ncols,
                nnz: triplets.len(),
            }
        })
    }
}

/// Calls `visit(row, col, value)` for every stored entry, column by column.
pub fn for_each_entry<F>(matrix: &SparseColMat<usize, f64>, mut visit: F)
where
    F: FnMut(usize, usize, f64),
{
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for col in 0..matrix.ncols() {
        for idx in col_ptr[col]..col_ptr[col + 1] {
            visit(row_idx[idx], col, values[idx]);
        }
    }
}

pub fn sparse_matvec(matrix: &SparseColMat<usize, f64>, vector: &[f64]) -> Array1<f64> {
    assert_eq!(matrix.ncols(), vector.len());
    let mut out = Array1::<f64>::zeros(matrix.nrows());
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    let row_idx = symbolic.row_idx();
    for (col, &x) in vector.iter().enumerate() {
        if x == 0.0 {
            continue;
        }
        for idx in col_ptr[col]..col_ptr[col + 1] {
            out[row_idx[idx]] += values[idx] * x;
        }
    }
    out
}

pub fn sparse_to_dense(matrix: &SparseColMat<usize, f64>) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((matrix.nrows(), matrix.ncols()));
    for_each_entry(matrix, |row, col, value| dense[[row, col]] += value);
    dense
}

/// Largest `|row - col|` over the stored entries.
pub fn bandwidth(matrix: &SparseColMat<usize, f64>) -> usize {
    let mut width = 0;
    for_each_entry(matrix, |row, col, _| width = width.max(row.abs_diff(col)));
    width
}

/// Sparse LLᵀ factor of a symmetric positive definite matrix.
pub struct SparseCholesky {
    factor: SparseLlt<usize, f64>,
    dim: usize,
}

impl SparseCholesky {
    /// Factorizes the matrix whose upper triangle (diagonal included) is `upper`.
    pub fn factorize_upper(upper: &SparseColMat<usize, f64>) -> Result<Self, SparseError> {
        let dim = upper.ncols();
        let factor = upper
            .as_ref()
            .sp_cholesky(Side::Upper)
            .map_err(|_| SparseError::NotPositiveDefinite { dim })?;
        Ok(Self { factor, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn solve(&self, rhs: &Array1<f64>) -> Array1<f64> {
        assert_eq!(rhs.len(), self.dim);
        let rhs_view = FaerColView::new(rhs);
        let out = self.factor.solve(rhs_view.as_ref());
        Array1::from_shape_fn(self.dim, |i| out[(i, 0)])
    }
}
