//! Joint log-density of the latent field: Gaussian likelihood per site times
//! the GMRF smoothness prior on each of the three parameter fields.
//!
//! For site `s` with records `(y, f)` and parameters `(alpha, beta, tau)`,
//! the residual is `r = y - alpha - beta·f` and the likelihood contributes
//! `-n/2·tau - ½·exp(-tau)·Σr²`. The prior contributes `-½·xᵀQx/sigma2`
//! per field. Everything the likelihood needs is captured by six per-site
//! sums, so one pass over the grouped records per evaluation is enough.

use crate::data::GroupedObservations;
use crate::precision::{Field, PrecisionMatrices};
use crate::sparse::{self, SparseError, TripletAccumulator};
use faer::sparse::SparseColMat;
use ndarray::{Array1, Array2, ArrayView1, s};
use rayon::prelude::*;
use std::sync::Arc;

/// Sufficient statistics of one site at the current `(alpha, beta)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SiteStatistics {
    pub n: usize,
    pub sum_resid: f64,
    pub sum_resid_sq: f64,
    pub sum_f_resid: f64,
    pub sum_f: f64,
    pub sum_f_sq: f64,
}

impl SiteStatistics {
    pub fn accumulate(observed: &[f64], covariate: &[f64], alpha: f64, beta: f64) -> Self {
        let mut stats = SiteStatistics {
            n: observed.len(),
            ..Default::default()
        };
        for (&y, &f) in observed.iter().zip(covariate.iter()) {
            let r = y - alpha - beta * f;
            stats.sum_resid += r;
            stats.sum_resid_sq += r * r;
            stats.sum_f_resid += f * r;
            stats.sum_f += f;
            stats.sum_f_sq += f * f;
        }
        stats
    }

    /// Likelihood curvature block over `(alpha, beta, tau)` at log-variance `tau`.
    pub fn curvature(&self, tau: f64) -> [[f64; 3]; 3] {
        let w = (-tau).exp();
        let aa = -(self.n as f64) * w;
        let bb = -w * self.sum_f_sq;
        let tt = -0.5 * w * self.sum_resid_sq;
        let ab = -w * self.sum_f;
        let at = -w * self.sum_resid;
        let bt = -w * self.sum_f_resid;
        [[aa, ab, at], [ab, bb, bt], [at, bt, tt]]
    }
}

/// Per-site statistics at `x`, computed independently for every site.
pub fn site_statistics(x: ArrayView1<f64>, data: &GroupedObservations) -> Vec<SiteStatistics> {
    let site_count = data.site_count();
    assert_eq!(x.len(), 3 * site_count, "latent vector must hold three fields");
    (0..site_count)
        .into_par_iter()
        .map(|site| {
            let (observed, covariate) = data.site_records(site);
            SiteStatistics::accumulate(
                observed,
                covariate,
                x[Field::Alpha.offset(site_count) + site],
                x[Field::Beta.offset(site_count) + site],
            )
        })
        .collect()
}

/// Hessian of the joint log-density in block form.
///
/// The matrix is `-Q/sigma2` on each field block plus, for every site, a
/// 3x3 likelihood block coupling `alpha_s`, `beta_s` and `tau_s`. The
/// likelihood never couples two different sites. Damping multiplies every
/// diagonal entry by `diagonal_scale` and leaves off-diagonals untouched.
#[derive(Debug, Clone)]
pub struct Hessian {
    precision: Arc<PrecisionMatrices>,
    prior_scale: f64,
    site_blocks: Vec<[[f64; 3]; 3]>,
    diagonal_scale: f64,
}

impl Hessian {
    pub fn new(
        precision: Arc<PrecisionMatrices>,
        sigma2: f64,
        site_blocks: Vec<[[f64; 3]; 3]>,
    ) -> Self {
        assert_eq!(site_blocks.len(), precision.site_count());
        Self {
            precision,
            prior_scale: 1.0 / sigma2,
            site_blocks,
            diagonal_scale: 1.0,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        3 * self.site_count()
    }

    #[inline]
    pub fn site_count(&self) -> usize {
        self.precision.site_count()
    }

    pub fn precision(&self) -> &PrecisionMatrices {
        &self.precision
    }

    pub fn diagonal_scale(&self) -> f64 {
        self.diagonal_scale
    }

    pub fn is_damped(&self) -> bool {
        self.diagonal_scale != 1.0
    }

    /// A copy with every diagonal entry multiplied by `1 + lambda`.
    pub fn damped(&self, lambda: f64) -> Hessian {
        Hessian {
            diagonal_scale: self.diagonal_scale * (1.0 + lambda),
            ..self.clone()
        }
    }

    /// Likelihood curvature of one site, before damping.
    pub fn site_block(&self, site: usize) -> [[f64; 3]; 3] {
        self.site_blocks[site]
    }

    pub fn is_finite(&self) -> bool {
        self.site_blocks
            .iter()
            .all(|block| block.iter().flatten().all(|v| v.is_finite()))
    }

    /// Visits every entry on or above the diagonal exactly once as
    /// `(row, col, value)` in latent-vector coordinates.
    pub fn for_each_upper<F>(&self, mut visit: F)
    where
        F: FnMut(usize, usize, f64),
    {
        let site_count = self.site_count();
        for field in Field::ALL {
            let k = field.index();
            let offset = field.offset(site_count);
            sparse::for_each_entry(self.precision.block(field), |row, col, q| {
                if row > col {
                    return;
                }
                let mut value = -self.prior_scale * q;
                if row == col {
                    value = (value + self.site_blocks[row][k][k]) * self.diagonal_scale;
                }
                visit(offset + row, offset + col, value);
            });
        }
        for (site, block) in self.site_blocks.iter().enumerate() {
            for (p, q) in [(0, 1), (0, 2), (1, 2)] {
                let value = block[p][q];
                if value != 0.0 {
                    visit(p * site_count + site, q * site_count + site, value);
                }
            }
        }
    }

    /// Upper triangle of `-H` in CSC form, ready for a sparse Cholesky.
    pub fn negated_upper(&self) -> Result<SparseColMat<usize, f64>, SparseError> {
        let mut acc = TripletAccumulator::new(self.dim(), self.dim());
        self.for_each_upper(|row, col, value| acc.add(row, col, -value));
        acc.into_csc()
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.dim(), self.dim()));
        self.for_each_upper(|row, col, value| {
            dense[(row, col)] = value;
            dense[(col, row)] = value;
        });
        dense
    }
}

/// Value, gradient and Hessian of the joint log-density at one point.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: f64,
    pub gradient: Array1<f64>,
    pub hessian: Hessian,
}

impl Evaluation {
    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
            && self.gradient.iter().all(|g| g.is_finite())
            && self.hessian.is_finite()
    }
}

/// Evaluates the joint log-density, its gradient and its Hessian at `x`.
///
/// `x` is laid out as `[alpha(0..S), beta(0..S), tau(0..S)]`. Pure function
/// of its inputs.
pub fn evaluate(
    x: ArrayView1<f64>,
    sigma2: f64,
    data: &GroupedObservations,
    precision: &Arc<PrecisionMatrices>,
) -> Evaluation {
    let site_count = precision.site_count();
    assert_eq!(data.site_count(), site_count, "data grouped for another grid");
    let stats = site_statistics(x, data);

    let mut value = 0.0;
    let mut gradient = Array1::<f64>::zeros(3 * site_count);
    for field in Field::ALL {
        let offset = field.offset(site_count);
        let block = x.slice(s![offset..offset + site_count]).to_vec();
        let q_x = precision.apply(field, &block);
        value -= 0.5 * q_x.dot(&Array1::from(block)) / sigma2;
        gradient
            .slice_mut(s![offset..offset + site_count])
            .scaled_add(-1.0 / sigma2, &q_x);
    }

    let tau_offset = Field::Tau.offset(site_count);
    let mut site_blocks = Vec::with_capacity(site_count);
    for (site, st) in stats.iter().enumerate() {
        let tau = x[tau_offset + site];
        let w = (-tau).exp();
        let n = st.n as f64;
        value -= 0.5 * n * tau + 0.5 * w * st.sum_resid_sq;
        gradient[Field::Alpha.offset(site_count) + site] += w * st.sum_resid;
        gradient[Field::Beta.offset(site_count) + site] += w * st.sum_f_resid;
        gradient[tau_offset + site] += -0.5 * n + 0.5 * w * st.sum_resid_sq;
        site_blocks.push(st.curvature(tau));
    }

    Evaluation {
        value,
        gradient,
        hessian: Hessian::new(Arc::clone(precision), sigma2, site_blocks),
    }
}

/// The joint log-density alone.
pub fn log_density(
    x: ArrayView1<f64>,
    sigma2: f64,
    data: &GroupedObservations,
    precision: &PrecisionMatrices,
) -> f64 {
    let site_count = precision.site_count();
    let stats = site_statistics(x, data);
    let prior: f64 = Field::ALL
        .iter()
        .map(|&field| {
            let offset = field.offset(site_count);
            let block = x.slice(s![offset..offset + site_count]).to_vec();
            precision.quadratic_form(field, &block)
        })
        .sum();
    let tau_offset = Field::Tau.offset(site_count);
    let likelihood: f64 = stats
        .iter()
        .enumerate()
        .map(|(site, st)| {
            let tau = x[tau_offset + site];
            0.5 * st.n as f64 * tau + 0.5 * (-tau).exp() * st.sum_resid_sq
        })
        .sum();
    -0.5 * prior / sigma2 - likelihood
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Observation, ObservationTable};
    use crate::grid::Grid;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_problem(
        rows: usize,
        cols: usize,
        periods: i64,
        seed: u64,
    ) -> (GroupedObservations, Arc<PrecisionMatrices>, Array1<f64>) {
        let grid = Grid::new(rows, cols).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let table: ObservationTable = (0..grid.site_count())
            .flat_map(|site| (0..periods).map(move |time| (site, time)))
            .map(|(site, time)| Observation {
                site,
                time,
                observed: rng.gen_range(-2.0..2.0),
                covariate: rng.gen_range(-1.5..1.5),
            })
            .collect();
        let data = GroupedObservations::new(&table, &grid).unwrap();
        let precision = Arc::new(PrecisionMatrices::build(grid).unwrap());
        let x = Array1::from_shape_fn(3 * grid.site_count(), |_| rng.gen_range(-0.8..0.8));
        (data, precision, x)
    }

    #[test]
    fn statistics_match_direct_sums() {
        let stats = SiteStatistics::accumulate(&[1.0, 3.0, 2.0], &[0.0, 1.0, 2.0], 0.5, 1.0);
        // residuals: 0.5, 1.5, -0.5
        assert_eq!(stats.n, 3);
        assert!((stats.sum_resid - 1.5).abs() < 1e-15);
        assert!((stats.sum_resid_sq - 2.75).abs() < 1e-15);
        assert!((stats.sum_f_resid - 0.5).abs() < 1e-15);
        assert!((stats.sum_f - 3.0).abs() < 1e-15);
        assert!((stats.sum_f_sq - 5.0).abs() < 1e-15);
    }

    #[test]
    fn value_matches_log_density() {
        let (data, precision, x) = random_problem(3, 4, 5, 11);
        let eval = evaluate(x.view(), 0.7, &data, &precision);
        let direct = log_density(x.view(), 0.7, &data, &precision);
        assert!((eval.value - direct).abs() <= 1e-12 * direct.abs().max(1.0));
    }

    #[test]
    fn gradient_matches_central_differences() {
        let (data, precision, x) = random_problem(3, 3, 6, 3);
        let sigma2 = 0.5;
        let eval = evaluate(x.view(), sigma2, &data, &precision);
        let h = 1e-5;
        for i in 0..x.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[i] += h;
            minus[i] -= h;
            let fd = (log_density(plus.view(), sigma2, &data, &precision)
                - log_density(minus.view(), sigma2, &data, &precision))
                / (2.0 * h);
            let analytic = eval.gradient[i];
            let scale = analytic.abs().max(fd.abs()).max(1.0);
            assert!(
                (analytic - fd).abs() / scale < 1e-5,
                "component {i}: analytic {analytic}, finite difference {fd}"
            );
        }
    }

    #[test]
    fn hessian_matches_differences_of_the_gradient() {
        let (data, precision, x) = random_problem(2, 3, 4, 5);
        let sigma2 = 1.3;
        let hessian = evaluate(x.view(), sigma2, &data, &precision)
            .hessian
            .to_dense();
        let h = 1e-6;
        for j in 0..x.len() {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus[j] += h;
            minus[j] -= h;
            let g_plus = evaluate(plus.view(), sigma2, &data, &precision).gradient;
            let g_minus = evaluate(minus.view(), sigma2, &data, &precision).gradient;
            for i in 0..x.len() {
                let fd = (g_plus[i] - g_minus[i]) / (2.0 * h);
                let scale = hessian[(i, j)].abs().max(1.0);
                assert!(
                    (hessian[(i, j)] - fd).abs() / scale < 1e-5,
                    "entry ({i},{j}): analytic {}, finite difference {fd}",
                    hessian[(i, j)]
                );
            }
        }
    }

    #[test]
    fn likelihood_never_couples_different_sites() {
        let (data, precision, x) = random_problem(3, 3, 4, 9);
        let site_count = precision.site_count();
        // With an enormous sigma2 the prior vanishes and only the site blocks remain.
        let hessian = evaluate(x.view(), 1e300, &data, &precision)
            .hessian
            .to_dense();
        for i in 0..3 * site_count {
            for j in 0..3 * site_count {
                if i % site_count != j % site_count {
                    assert!(hessian[(i, j)].abs() < 1e-250, "({i},{j})");
                }
            }
        }
    }

    #[test]
    fn damping_scales_only_the_diagonal() {
        let (data, precision, x) = random_problem(2, 2, 3, 1);
        let hessian = evaluate(x.view(), 0.9, &data, &precision).hessian;
        let damped = hessian.damped(1.0);
        assert!(damped.is_damped());
        assert!(!hessian.is_damped());
        let plain = hessian.to_dense();
        let scaled = damped.to_dense();
        for i in 0..plain.nrows() {
            for j in 0..plain.ncols() {
                let expected = if i == j { 2.0 * plain[(i, j)] } else { plain[(i, j)] };
                assert!((scaled[(i, j)] - expected).abs() < 1e-14);
            }
        }
        let negated = sparse::sparse_to_dense(&damped.negated_upper().unwrap());
        for i in 0..plain.nrows() {
            for j in 0..plain.ncols() {
                let expected = if i <= j { -scaled[(i, j)] } else { 0.0 };
                assert!((negated[(i, j)] - expected).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn empty_site_has_prior_only_curvature() {
        let grid = Grid::new(2, 2).unwrap();
        let table = ObservationTable::new(vec![Observation {
            site: 0,
            time: 0,
            observed: 1.0,
            covariate: 0.5,
        }]);
        let data = GroupedObservations::new(&table, &grid).unwrap();
        let precision = Arc::new(PrecisionMatrices::build(grid).unwrap());
        let eval = evaluate(Array1::zeros(12).view(), 1.0, &data, &precision);
        assert_eq!(eval.hessian.site_block(3), [[0.0; 3]; 3]);
        assert_eq!(eval.gradient[Field::Tau.offset(4) + 3], 0.0);
        assert!(eval.is_finite());
    }
}
