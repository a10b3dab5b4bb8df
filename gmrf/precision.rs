//! Prior precision of the 2-D random-walk smoothness model.
//!
//! The structural matrix `D` is a discrete Laplacian with free boundaries:
//! every lattice edge contributes `-0.25` off the diagonal, and each diagonal
//! entry is `0.25` times the number of neighbours the site actually has. The
//! prior precision of each parameter field is `Q = DᵀD`, so `Q·1 = 0` and the
//! overall level of a field is left to the likelihood.

use crate::grid::{Grid, GridError};
use crate::sparse::{self, SparseError, TripletAccumulator};
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2};
use std::sync::Arc;
use thiserror::Error;

/// Weight of a single lattice edge in `D`.
const EDGE_WEIGHT: f64 = 0.25;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PrecisionError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("precision assembly failed: {0}")]
    Sparse(#[from] SparseError),
}

/// One of the three per-site parameter fields of the latent vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Local intercept.
    Alpha,
    /// Local slope on the covariate.
    Beta,
    /// Local log-variance of the residual.
    Tau,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Alpha, Field::Beta, Field::Tau];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Field::Alpha => 0,
            Field::Beta => 1,
            Field::Tau => 2,
        }
    }

    /// Position of this field's first entry in the latent vector
    /// `[alpha(0..S), beta(0..S), tau(0..S)]`.
    #[inline]
    pub fn offset(self, site_count: usize) -> usize {
        self.index() * site_count
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Alpha => "alpha",
            Field::Beta => "beta",
            Field::Tau => "tau",
        }
    }
}

/// The structural matrix `D` and the three field precisions built from it.
///
/// All three blocks currently share one allocation of `DᵀD`; they are exposed
/// per field so callers never depend on that sharing.
#[derive(Debug, Clone)]
pub struct PrecisionMatrices {
    grid: Grid,
    structure: SparseColMat<usize, f64>,
    blocks: [Arc<SparseColMat<usize, f64>>; 3],
}

impl PrecisionMatrices {
    pub fn for_shape(rows: usize, cols: usize) -> Result<Self, PrecisionError> {
        Self::build(Grid::new(rows, cols)?)
    }

    pub fn build(grid: Grid) -> Result<Self, PrecisionError> {
        let structure = build_structure_matrix(&grid)?;
        let q = Arc::new(gram(&structure)?);
        log::debug!(
            "Built {}x{} lattice precision: {} sites, bandwidth {}",
            grid.rows(),
            grid.cols(),
            grid.site_count(),
            sparse::bandwidth(&q)
        );
        Ok(Self {
            grid,
            structure,
            blocks: [q.clone(), q.clone(), q],
        })
    }

    #[inline]
    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    #[inline]
    pub fn site_count(&self) -> usize {
        self.grid.site_count()
    }

    /// The structural matrix `D`.
    pub fn structure(&self) -> &SparseColMat<usize, f64> {
        &self.structure
    }

    pub fn block(&self, field: Field) -> &SparseColMat<usize, f64> {
        &self.blocks[field.index()]
    }

    /// `Q_field · x` for a field-sized vector.
    pub fn apply(&self, field: Field, x: &[f64]) -> Array1<f64> {
        sparse::sparse_matvec(self.block(field), x)
    }

    /// `xᵀ Q_field x`.
    pub fn quadratic_form(&self, field: Field, x: &[f64]) -> f64 {
        self.apply(field, x)
            .iter()
            .zip(x.iter())
            .map(|(qx, xi)| qx * xi)
            .sum()
    }

    /// Largest index distance between coupled sites in any block.
    pub fn bandwidth(&self) -> usize {
        Field::ALL
            .iter()
            .map(|&field| sparse::bandwidth(self.block(field)))
            .max()
            .unwrap_or(0)
    }

    pub fn block_dense(&self, field: Field) -> Array2<f64> {
        sparse::sparse_to_dense(self.block(field))
    }
}

/// Assembles `D` with offsets `1` (same column) and `rows` (same row).
///
/// In the column-major layout, `site + 1` of the last row in a column is the
/// first row of the next column; that coupling must stay zero.
fn build_structure_matrix(grid: &Grid) -> Result<SparseColMat<usize, f64>, SparseError> {
    let rows = grid.rows();
    let site_count = grid.site_count();
    let mut acc = TripletAccumulator::new(site_count, site_count);

    for site in 0..site_count {
        let missing = 4 - grid.neighbor_count(site);
        acc.add(site, site, 1.0 - EDGE_WEIGHT * missing as f64);

        let next = site + 1;
        if next < site_count {
            let crosses_column = next % rows == 0;
            let value = if crosses_column { 0.0 } else { -EDGE_WEIGHT };
            acc.add(site, next, value);
            acc.add(next, site, value);
        }

        let across = site + rows;
        if across < site_count {
            acc.add(site, across, -EDGE_WEIGHT);
            acc.add(across, site, -EDGE_WEIGHT);
        }
    }

    acc.into_csc()
}

/// `DᵀD` as a sum of outer products of the rows of `D`.
fn gram(d: &SparseColMat<usize, f64>) -> Result<SparseColMat<usize, f64>, SparseError> {
    let mut row_entries: Vec<Vec<(usize, f64)>> = vec![Vec::new(); d.nrows()];
    sparse::for_each_entry(d, |row, col, value| row_entries[row].push((col, value)));

    let mut acc = TripletAccumulator::new(d.ncols(), d.ncols());
    for entries in &row_entries {
        for &(i, di) in entries {
            for &(j, dj) in entries {
                acc.add(i, j, di * dj);
            }
        }
    }
    acc.into_csc()
}
