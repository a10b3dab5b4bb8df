//! Laplace approximation around the posterior mode.
//!
//! The posterior is approximated by a Gaussian centred at the mode with
//! precision `-H`. Only the marginal standard deviations
//! `sqrt([(-H)⁻¹]_ii)` are extracted.

use crate::data::ObservationTable;
use crate::estimate::NumericalError;
use crate::faer_ndarray::FaerCholesky;
use crate::objective::Hessian;
use crate::precision::Field;
use crate::selected_inverse::{self, BandError, SymmetricBand};
use faer::Side;
use ndarray::{Array1, ArrayView1, s};
use serde::{Deserialize, Serialize};

/// Above this many latent entries the dense inverse is logged as a scaling hazard.
const DENSE_INVERSE_WARN_DIM: usize = 3_000;

/// How the diagonal of `(-H)⁻¹` is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceMethod {
    /// Takahashi recursion on a band factor, `O(S · min(rows, cols)²)`.
    #[default]
    SelectedInverse,
    /// Full dense inverse through a dense Cholesky factor. Small grids only.
    Dense,
}

/// Which curvature the standard deviations are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceHessian {
    /// The damped Hessian of the final Newton iteration. Its diagonal is
    /// inflated by `1 + lambda`, so variances come out somewhat small.
    #[default]
    Damped,
    /// The Hessian re-evaluated at the mode without damping.
    Undamped,
}

/// Orders the latent vector so that the three parameters of a site sit next
/// to each other and sites advance along the shorter side of the grid. The
/// bandwidth of `-H` is then `6·min(rows, cols) + 2`.
struct InterleavedOrdering {
    rows: usize,
    cols: usize,
    site_count: usize,
    row_major: bool,
}

impl InterleavedOrdering {
    fn for_hessian(hessian: &Hessian) -> Self {
        let grid = hessian.precision().grid();
        Self {
            rows: grid.rows(),
            cols: grid.cols(),
            site_count: grid.site_count(),
            row_major: grid.rows() > grid.cols(),
        }
    }

    #[inline]
    fn position(&self, latent: usize) -> usize {
        let field = latent / self.site_count;
        let site = latent % self.site_count;
        let ordered_site = if self.row_major {
            let (row, col) = (site % self.rows, site / self.rows);
            row * self.cols + col
        } else {
            site
        };
        3 * ordered_site + field
    }
}

/// Band copy of `-H` in interleaved order.
fn negated_band(hessian: &Hessian, ordering: &InterleavedOrdering) -> SymmetricBand {
    let mut width = 0;
    hessian.for_each_upper(|row, col, _| {
        width = width.max(ordering.position(row).abs_diff(ordering.position(col)));
    });
    let mut band = SymmetricBand::zeros(hessian.dim(), width);
    hessian.for_each_upper(|row, col, value| {
        band.add(ordering.position(row), ordering.position(col), -value);
    });
    band
}

/// Diagonal of `(-H)⁻¹` in latent-vector order.
pub fn marginal_variances(
    hessian: &Hessian,
    method: VarianceMethod,
) -> Result<Array1<f64>, NumericalError> {
    let variances = match method {
        VarianceMethod::SelectedInverse => {
            let ordering = InterleavedOrdering::for_hessian(hessian);
            let band = negated_band(hessian, &ordering);
            log::debug!(
                "Selected inverse on {} unknowns with bandwidth {}",
                band.dim(),
                band.width()
            );
            let ordered = selected_inverse::inverse_diagonal(&band).map_err(|e| match e {
                BandError::NotPositiveDefinite { pivot, .. } => {
                    NumericalError::PosteriorNotPositiveDefinite { pivot }
                }
            })?;
            Array1::from_shape_fn(hessian.dim(), |i| ordered[ordering.position(i)])
        }
        VarianceMethod::Dense => {
            if hessian.dim() > DENSE_INVERSE_WARN_DIM {
                log::warn!(
                    "Dense inverse of a {0}x{0} posterior precision does not scale; prefer the selected inverse",
                    hessian.dim()
                );
            }
            let precision = -hessian.to_dense();
            let factor = precision
                .cholesky(Side::Lower)
                .map_err(|e| NumericalError::DenseInverseFailed(e.to_string()))?;
            factor.inverse().diag().to_owned()
        }
    };

    if let Some((index, &value)) = variances
        .iter()
        .enumerate()
        .find(|(_, v)| !(v.is_finite() && **v > 0.0))
    {
        return Err(NumericalError::NonPositiveVariance { index, value });
    }
    Ok(variances)
}

/// Posterior mode and marginal standard deviations, split per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    pub alpha: Array1<f64>,
    pub beta: Array1<f64>,
    pub tau: Array1<f64>,
    pub alpha_sd: Array1<f64>,
    pub beta_sd: Array1<f64>,
    pub tau_sd: Array1<f64>,
}

impl PosteriorSummary {
    pub fn from_mode(
        mode: ArrayView1<f64>,
        hessian: &Hessian,
        method: VarianceMethod,
    ) -> Result<Self, NumericalError> {
        let site_count = hessian.site_count();
        assert_eq!(mode.len(), 3 * site_count);
        let sd = marginal_variances(hessian, method)?.mapv(f64::sqrt);
        let part = |v: ArrayView1<f64>, field: Field| {
            let offset = field.offset(site_count);
            v.slice(s![offset..offset + site_count]).to_owned()
        };
        Ok(Self {
            alpha: part(mode, Field::Alpha),
            beta: part(mode, Field::Beta),
            tau: part(mode, Field::Tau),
            alpha_sd: part(sd.view(), Field::Alpha),
            beta_sd: part(sd.view(), Field::Beta),
            tau_sd: part(sd.view(), Field::Tau),
        })
    }

    pub fn site_count(&self) -> usize {
        self.alpha.len()
    }

    pub fn mode(&self, field: Field) -> &Array1<f64> {
        match field {
            Field::Alpha => &self.alpha,
            Field::Beta => &self.beta,
            Field::Tau => &self.tau,
        }
    }

    pub fn sd(&self, field: Field) -> &Array1<f64> {
        match field {
            Field::Alpha => &self.alpha_sd,
            Field::Beta => &self.beta_sd,
            Field::Tau => &self.tau_sd,
        }
    }

    /// The mode as one latent vector `[alpha, beta, tau]`.
    pub fn mode_vector(&self) -> Array1<f64> {
        ndarray::concatenate![ndarray::Axis(0), self.alpha, self.beta, self.tau]
    }

    /// Fitted value `alpha_s + beta_s · covariate` and residual for every record.
    pub fn fitted_values(&self, table: &ObservationTable) -> Vec<FittedRecord> {
        table
            .iter()
            .map(|obs| {
                let fitted = self.alpha[obs.site] + self.beta[obs.site] * obs.covariate;
                FittedRecord {
                    site: obs.site,
                    time: obs.time,
                    observed: obs.observed,
                    covariate: obs.covariate,
                    fitted,
                    residual: obs.observed - fitted,
                }
            })
            .collect()
    }
}

/// Diagnostic row for one input record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FittedRecord {
    pub site: usize,
    pub time: i64,
    pub observed: f64,
    pub covariate: f64,
    pub fitted: f64,
    pub residual: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{GroupedObservations, Observation};
    use crate::grid::Grid;
    use crate::objective::evaluate;
    use crate::precision::PrecisionMatrices;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    fn hessian_for(rows: usize, cols: usize, seed: u64) -> (Hessian, Array1<f64>) {
        let grid = Grid::new(rows, cols).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let table: ObservationTable = (0..grid.site_count())
            .flat_map(|site| (0..8).map(move |time| (site, time)))
            .map(|(site, time)| {
                let covariate = rng.gen_range(-1.0..1.0);
                Observation {
                    site,
                    time,
                    observed: 0.3 + 1.2 * covariate + rng.gen_range(-0.4..0.4),
                    covariate,
                }
            })
            .collect();
        let data = GroupedObservations::new(&table, &grid).unwrap();
        let precision = Arc::new(PrecisionMatrices::build(grid).unwrap());
        let mut x = Array1::zeros(3 * grid.site_count());
        for site in 0..grid.site_count() {
            x[site] = 0.3;
            x[grid.site_count() + site] = 1.2;
            x[2 * grid.site_count() + site] = -3.0;
        }
        let hessian = evaluate(x.view(), 0.8, &data, &precision).hessian.damped(1.0);
        (hessian, x)
    }

    #[test]
    fn selected_inverse_agrees_with_dense_inverse() {
        for (rows, cols, seed) in [(2, 2, 1), (3, 5, 2), (5, 3, 3), (4, 4, 4)] {
            let (hessian, _) = hessian_for(rows, cols, seed);
            let selected = marginal_variances(&hessian, VarianceMethod::SelectedInverse).unwrap();
            let dense = marginal_variances(&hessian, VarianceMethod::Dense).unwrap();
            for (a, b) in selected.iter().zip(dense.iter()) {
                assert!((a - b).abs() <= 1e-9 * b.abs(), "{rows}x{cols}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn interleaved_ordering_is_a_permutation_with_short_side_stride() {
        for (rows, cols) in [(2, 6), (6, 2), (4, 4)] {
            let (hessian, _) = hessian_for(rows, cols, 9);
            let ordering = InterleavedOrdering::for_hessian(&hessian);
            let mut seen = vec![false; hessian.dim()];
            for latent in 0..hessian.dim() {
                let pos = ordering.position(latent);
                assert!(!seen[pos]);
                seen[pos] = true;
            }
            let band = negated_band(&hessian, &ordering);
            assert!(band.width() <= 6 * rows.min(cols) + 2, "{rows}x{cols}");
        }
    }

    #[test]
    fn summary_splits_fields_and_fits_records() {
        let (hessian, x) = hessian_for(2, 3, 5);
        let summary =
            PosteriorSummary::from_mode(x.view(), &hessian, VarianceMethod::SelectedInverse)
                .unwrap();
        assert_eq!(summary.site_count(), 6);
        assert_eq!(summary.mode_vector(), x);
        assert!(summary.sd(Field::Tau).iter().all(|&v| v > 0.0));
        assert_eq!(summary.mode(Field::Beta)[4], 1.2);

        let table = ObservationTable::new(vec![Observation {
            site: 4,
            time: 2020,
            observed: 2.0,
            covariate: 1.0,
        }]);
        let fitted = summary.fitted_values(&table);
        assert_eq!(fitted.len(), 1);
        assert!((fitted[0].fitted - 1.5).abs() < 1e-12);
        assert!((fitted[0].residual - 0.5).abs() < 1e-12);
    }

    #[test]
    fn damping_shrinks_marginal_variances() {
        let (hessian, _) = hessian_for(3, 3, 6);
        let base = marginal_variances(&hessian, VarianceMethod::Dense).unwrap();
        let heavier = marginal_variances(&hessian.damped(1.0), VarianceMethod::Dense).unwrap();
        assert!(base.iter().zip(heavier.iter()).all(|(a, b)| b < a));
    }
}
