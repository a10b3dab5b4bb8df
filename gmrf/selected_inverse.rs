//! Entries of a sparse inverse inside the band of a symmetric matrix.
//!
//! For `A = LLᵀ` with `L` banded (lower bandwidth `b`), every entry of
//! `Σ = A⁻¹` inside the band follows from the Takahashi recursion
//!
//! ```text
//! Σ_ij = δ_ij / L_ii² − (1 / L_ii) · Σ_{k = i+1}^{i+b} L_ki Σ_kj,   j ≥ i
//! ```
//!
//! run from the last row upward. Both the factorization and the recursion
//! cost `O(n·b²)` time and `O(n·b)` memory, so the marginal variances of a
//! lattice model never need a dense inverse.

use ndarray::{Array1, Array2};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BandError {
    #[error("band Cholesky failed at pivot {pivot}: matrix is not positive definite (pivot value {value:.3e})")]
    NotPositiveDefinite { pivot: usize, value: f64 },
}

/// Symmetric matrix stored by its lower band: `lower[[c, d]] = A[c + d, c]`.
#[derive(Debug, Clone)]
pub struct SymmetricBand {
    width: usize,
    lower: Array2<f64>,
}

impl SymmetricBand {
    pub fn zeros(dim: usize, width: usize) -> Self {
        Self {
            width,
            lower: Array2::zeros((dim, width + 1)),
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.lower.nrows()
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Adds `value` at `(row, col)` and, implicitly, at `(col, row)`.
    ///
    /// # Panics
    /// If the position lies outside the band.
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        let (hi, lo) = if row >= col { (row, col) } else { (col, row) };
        let offset = hi - lo;
        assert!(
            offset <= self.width,
            "entry ({row}, {col}) outside band of width {}",
            self.width
        );
        self.lower[[lo, offset]] += value;
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        let (hi, lo) = if row >= col { (row, col) } else { (col, row) };
        if hi - lo > self.width {
            0.0
        } else {
            self.lower[[lo, hi - lo]]
        }
    }

    /// Band Cholesky factorization `A = LLᵀ`; `L` keeps the same bandwidth.
    pub fn cholesky(&self) -> Result<BandCholesky, BandError> {
        let n = self.dim();
        let b = self.width;
        let mut l = Array2::<f64>::zeros((n, b + 1));

        for j in 0..n {
            let last = (j + b).min(n - 1);
            for i in j..=last {
                let mut sum = self.lower[[j, i - j]];
                for k in i.saturating_sub(b)..j {
                    sum -= l[[k, i - k]] * l[[k, j - k]];
                }
                if i == j {
                    if !(sum > 0.0 && sum.is_finite()) {
                        return Err(BandError::NotPositiveDefinite {
                            pivot: j,
                            value: sum,
                        });
                    }
                    l[[j, 0]] = sum.sqrt();
                } else {
                    l[[j, i - j]] = sum / l[[j, 0]];
                }
            }
        }

        Ok(BandCholesky { width: b, lower: l })
    }
}

/// Lower band factor with `lower[[c, d]] = L[c + d, c]`.
#[derive(Debug, Clone)]
pub struct BandCholesky {
    width: usize,
    lower: Array2<f64>,
}

impl BandCholesky {
    #[inline]
    pub fn dim(&self) -> usize {
        self.lower.nrows()
    }

    /// Overwrites the factor with the band of the inverse.
    pub fn into_selected_inverse(self) -> SymmetricBand {
        let n = self.dim();
        let b = self.width;
        let mut band = self.lower;

        for i in (0..n).rev() {
            let last = (i + b).min(n - 1);
            // Column i of L is about to be replaced by row i of the inverse.
            let column = band.row(i).to_owned();
            let pivot = column[0];
            for j in (i..=last).rev() {
                let mut acc = 0.0;
                for k in (i + 1)..=last {
                    let (hi, lo) = if k >= j { (k, j) } else { (j, k) };
                    acc += column[k - i] * band[[lo, hi - lo]];
                }
                let delta = if i == j { 1.0 / pivot } else { 0.0 };
                band[[i, j - i]] = (delta - acc) / pivot;
            }
        }

        SymmetricBand {
            width: b,
            lower: band,
        }
    }
}

/// Diagonal of the inverse of `a`.
pub fn inverse_diagonal(a: &SymmetricBand) -> Result<Array1<f64>, BandError> {
    let inverse = a.cholesky()?.into_selected_inverse();
    Ok(inverse.lower.column(0).to_owned())
}
