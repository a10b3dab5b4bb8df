//! Damped Newton–Raphson search for the posterior mode.
//!
//! Each iteration evaluates the joint log-density at the current point,
//! multiplies the diagonal of its Hessian by `1 + lambda` and solves
//! `(-H_damped) Δ = g` with a sparse Cholesky factorization. The iteration
//! has converged once the mean squared step drops below the tolerance.
//!
//! A short damped step does not prove the point is a mode: with a small
//! `sigma2` the damped prior diagonal `(1 + lambda) Q_ii / sigma2` shrinks every
//! step, so the iteration can stop far from stationarity. The returned point
//! is therefore checked once more with an undamped Newton step.

use crate::data::GroupedObservations;
use crate::estimate::{EstimationError, NumericalError};
use crate::model::FitConfig;
use crate::objective::{Evaluation, Hessian, evaluate};
use crate::precision::PrecisionMatrices;
use crate::sparse::{SparseCholesky, SparseError};
use ndarray::Array1;
use std::sync::Arc;
use std::time::Instant;

/// Where the iteration stands after the most recent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonStatus {
    Iterating,
    Converged,
}

/// Diagnostics of a single Newton step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// 1-based iteration number.
    pub iteration: usize,
    /// Log-density at the point the step started from.
    pub objective: f64,
    /// `mean(Δ²)`, the quantity compared against the tolerance.
    pub step_msq: f64,
    /// Euclidean norm of the gradient at the starting point.
    pub gradient_norm: f64,
}

/// Largest accepted ratio between the mean squared undamped step at the
/// returned point and the tolerance. Slow but genuine convergence stays
/// within a few thousand.
const STALL_RATIO: f64 = 1e4;

/// The located mode and the curvature of its final iteration.
#[derive(Debug, Clone)]
pub struct ModeResult {
    pub mode: Array1<f64>,
    /// Damped Hessian evaluated at the start of the final step.
    pub hessian: Hessian,
    /// Undamped Hessian at `mode`.
    pub curvature: Hessian,
    pub iterations: usize,
    pub final_step_msq: f64,
    /// Log-density at `mode`.
    pub objective: f64,
    /// Euclidean norm of the gradient at `mode`.
    pub gradient_norm: f64,
    /// Mean squared undamped Newton step from `mode`; infinite when the
    /// undamped negative Hessian is not positive definite there.
    pub undamped_step_msq: f64,
    /// Whether `mode` is a stationary point and not merely a place where the
    /// damped steps became short.
    pub stationary: bool,
}

/// A Newton iteration that can be advanced one step at a time.
pub struct NewtonIteration<'a> {
    data: &'a GroupedObservations,
    precision: &'a Arc<PrecisionMatrices>,
    config: &'a FitConfig,
    x: Array1<f64>,
    iteration: usize,
    status: NewtonStatus,
    last_hessian: Option<Hessian>,
    last_report: Option<StepReport>,
}

impl<'a> NewtonIteration<'a> {
    pub fn new(
        start: Array1<f64>,
        data: &'a GroupedObservations,
        precision: &'a Arc<PrecisionMatrices>,
        config: &'a FitConfig,
    ) -> Self {
        assert_eq!(
            start.len(),
            3 * precision.site_count(),
            "start vector must hold three fields"
        );
        Self {
            data,
            precision,
            config,
            x: start,
            iteration: 0,
            status: NewtonStatus::Iterating,
            last_hessian: None,
            last_report: None,
        }
    }

    pub fn status(&self) -> NewtonStatus {
        self.status
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// The current point.
    pub fn position(&self) -> &Array1<f64> {
        &self.x
    }

    pub fn last_report(&self) -> Option<StepReport> {
        self.last_report
    }

    /// Performs one damped Newton step from the current point.
    pub fn step(&mut self) -> Result<StepReport, EstimationError> {
        self.iteration += 1;
        let iteration = self.iteration;

        let eval = evaluate(self.x.view(), self.config.sigma2, self.data, self.precision);
        if !eval.is_finite() {
            log::error!("Non-finite log-density or derivatives at iteration {iteration}");
            return Err(NumericalError::NonFiniteObjective { iteration }.into());
        }

        let damped = eval.hessian.damped(self.config.damping);
        let upper = damped.negated_upper().map_err(NumericalError::Assembly)?;
        let factor = SparseCholesky::factorize_upper(&upper).map_err(|e| match e {
            SparseError::NotPositiveDefinite { .. } => {
                NumericalError::NotPositiveDefinite { iteration }
            }
            other => NumericalError::Assembly(other),
        })?;
        let delta = factor.solve(&eval.gradient);
        if !delta.iter().all(|d| d.is_finite()) {
            log::error!("Non-finite Newton step at iteration {iteration}");
            return Err(NumericalError::NonFiniteStep { iteration }.into());
        }

        let step_msq = delta.dot(&delta) / delta.len() as f64;
        self.x += &delta;

        let report = StepReport {
            iteration,
            objective: eval.value,
            step_msq,
            gradient_norm: eval.gradient.dot(&eval.gradient).sqrt(),
        };
        log::debug!(
            "Newton iteration {}: log-density {:.6e}, |g| {:.3e}, mean squared step {:.3e}",
            report.iteration,
            report.objective,
            report.gradient_norm,
            report.step_msq
        );

        self.status = if step_msq < self.config.tolerance {
            NewtonStatus::Converged
        } else {
            NewtonStatus::Iterating
        };
        self.last_hessian = Some(damped);
        self.last_report = Some(report);
        Ok(report)
    }

    /// Finishes the iteration and checks the current point with an undamped
    /// step. Fails with `DidNotConverge` (carrying the iterations taken so far)
    /// unless the last step met the tolerance.
    pub fn into_mode(self) -> Result<ModeResult, EstimationError> {
        let (Some(report), Some(hessian), NewtonStatus::Converged) =
            (self.last_report, self.last_hessian, self.status)
        else {
            return Err(EstimationError::DidNotConverge {
                max_iterations: self.iteration,
                last_step_msq: self
                    .last_report
                    .map_or(f64::INFINITY, |report| report.step_msq),
            });
        };

        let at_mode = evaluate(self.x.view(), self.config.sigma2, self.data, self.precision);
        if !at_mode.is_finite() {
            return Err(NumericalError::NonFiniteObjective {
                iteration: self.iteration,
            }
            .into());
        }
        let undamped_step_msq = undamped_step_msq(&at_mode)?;
        Ok(ModeResult {
            mode: self.x,
            hessian,
            iterations: self.iteration,
            final_step_msq: report.step_msq,
            objective: at_mode.value,
            gradient_norm: at_mode.gradient.dot(&at_mode.gradient).sqrt(),
            undamped_step_msq,
            stationary: undamped_step_msq <= STALL_RATIO * self.config.tolerance,
            curvature: at_mode.hessian,
        })
    }
}

fn undamped_step_msq(eval: &Evaluation) -> Result<f64, NumericalError> {
    let upper = eval
        .hessian
        .negated_upper()
        .map_err(NumericalError::Assembly)?;
    match SparseCholesky::factorize_upper(&upper) {
        Ok(factor) => {
            let delta = factor.solve(&eval.gradient);
            Ok(delta.dot(&delta) / delta.len() as f64)
        }
        Err(SparseError::NotPositiveDefinite { .. }) => Ok(f64::INFINITY),
        Err(other) => Err(NumericalError::Assembly(other)),
    }
}

/// Finds the posterior mode starting from `x = 0`.
pub fn find_mode(
    data: &GroupedObservations,
    precision: &Arc<PrecisionMatrices>,
    config: &FitConfig,
) -> Result<ModeResult, EstimationError> {
    let start = Array1::zeros(3 * precision.site_count());
    find_mode_from(start, data, precision, config)
}

/// Finds the posterior mode starting from a caller-supplied point.
pub fn find_mode_from(
    start: Array1<f64>,
    data: &GroupedObservations,
    precision: &Arc<PrecisionMatrices>,
    config: &FitConfig,
) -> Result<ModeResult, EstimationError> {
    let timer = Instant::now();
    let mut newton = NewtonIteration::new(start, data, precision, config);

    while newton.iteration() < config.max_iterations {
        newton.step()?;
        if newton.status() == NewtonStatus::Converged {
            break;
        }
    }

    if newton.status() != NewtonStatus::Converged {
        let last_step_msq = newton
            .last_report()
            .map_or(f64::INFINITY, |report| report.step_msq);
        log::warn!(
            "Newton stopped after {} iterations with mean squared step {:.3e}",
            config.max_iterations,
            last_step_msq
        );
        return Err(EstimationError::DidNotConverge {
            max_iterations: config.max_iterations,
            last_step_msq,
        });
    }

    let result = newton.into_mode()?;
    if result.stationary {
        log::info!(
            "Newton converged in {} iterations ({:.2?}); final mean squared step {:.3e}, |g| {:.3e}",
            result.iterations,
            timer.elapsed(),
            result.final_step_msq,
            result.gradient_norm
        );
    } else {
        log::warn!(
            "Newton steps fell below the tolerance after {} iterations, but the point is not \
             stationary: |g| {:.3e}, undamped mean squared step {:.3e} against a final damped \
             step of {:.3e}. A larger sigma2, less damping or a smaller tolerance may help.",
            result.iterations,
            result.gradient_norm,
            result.undamped_step_msq,
            result.final_step_msq
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Observation, ObservationTable};
    use crate::grid::Grid;
    use crate::objective::log_density;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noisy_problem(seed: u64) -> (GroupedObservations, Arc<PrecisionMatrices>) {
        let grid = Grid::new(3, 3).unwrap();
        let mut rng = StdRng::seed_from_u64(seed);
        let table: ObservationTable = (0..grid.site_count())
            .flat_map(|site| (0..20).map(move |time| (site, time)))
            .map(|(site, time)| {
                let covariate = rng.gen_range(-1.0..1.0);
                Observation {
                    site,
                    time,
                    observed: 1.0 - 0.5 * covariate + rng.gen_range(-0.5..0.5),
                    covariate,
                }
            })
            .collect();
        let data = GroupedObservations::new(&table, &grid).unwrap();
        (data, Arc::new(PrecisionMatrices::build(grid).unwrap()))
    }

    #[test]
    fn steps_report_progress_and_converge() {
        let (data, precision) = noisy_problem(17);
        let config = FitConfig::new(1.0);
        let mut newton =
            NewtonIteration::new(Array1::zeros(27), &data, &precision, &config);
        assert!(newton.last_report().is_none());

        let first = newton.step().unwrap();
        assert_eq!(first.iteration, 1);
        assert!(first.step_msq > config.tolerance);
        assert!(first.gradient_norm > 0.0);
        assert_eq!(newton.status(), NewtonStatus::Iterating);

        while newton.status() == NewtonStatus::Iterating {
            newton.step().unwrap();
            assert!(newton.iteration() <= 50);
        }
        let result = newton.into_mode().unwrap();
        assert!(result.final_step_msq < config.tolerance);
        assert!(result.hessian.is_damped());
        assert!(!result.curvature.is_damped());
        assert!(result.stationary);
        assert!(result.gradient_norm < first.gradient_norm);
    }

    #[test]
    fn mode_improves_on_the_starting_point() {
        let (data, precision) = noisy_problem(4);
        let config = FitConfig::new(0.5);
        let result = find_mode(&data, &precision, &config).unwrap();
        let at_zero = log_density(Array1::zeros(27).view(), 0.5, &data, &precision);
        let at_mode = log_density(result.mode.view(), 0.5, &data, &precision);
        assert!(at_mode > at_zero);
    }

    #[test]
    fn unconverged_iteration_yields_no_mode() {
        let (data, precision) = noisy_problem(8);
        let config = FitConfig::new(1.0);
        let mut newton =
            NewtonIteration::new(Array1::zeros(27), &data, &precision, &config);
        newton.step().unwrap();
        assert!(matches!(
            newton.into_mode(),
            Err(EstimationError::DidNotConverge {
                max_iterations: 1,
                ..
            })
        ));
    }

    #[test]
    fn iteration_limit_is_reported() {
        let (data, precision) = noisy_problem(2);
        let config = FitConfig {
            max_iterations: 2,
            ..FitConfig::new(1.0)
        };
        match find_mode(&data, &precision, &config) {
            Err(EstimationError::DidNotConverge {
                max_iterations,
                last_step_msq,
            }) => {
                assert_eq!(max_iterations, 2);
                assert!(last_step_msq.is_finite() && last_step_msq >= config.tolerance);
            }
            other => panic!("expected DidNotConverge, got {other:?}"),
        }
    }

    #[test]
    fn short_steps_under_a_stiff_prior_are_not_stationary() {
        let (data, precision) = noisy_problem(6);
        let config = FitConfig::new(1e-4);
        let result = find_mode(&data, &precision, &config).unwrap();
        assert!(result.final_step_msq < config.tolerance);
        assert!(!result.stationary);
        assert!(result.undamped_step_msq > STALL_RATIO * config.tolerance);

        let at_zero = evaluate(Array1::zeros(27).view(), 1e-4, &data, &precision);
        let first_norm = at_zero.gradient.dot(&at_zero.gradient).sqrt();
        assert!(result.gradient_norm > 0.5 * first_norm);
    }

    #[test]
    fn overflowing_start_is_a_numerical_error() {
        let (data, precision) = noisy_problem(3);
        let config = FitConfig::new(1.0);
        let mut start = Array1::zeros(27);
        // exp(-tau) overflows for a very negative log-variance.
        start[18] = -1e4;
        let err = find_mode_from(start, &data, &precision, &config).unwrap_err();
        assert!(matches!(
            err,
            EstimationError::Numerical(NumericalError::NonFiniteObjective { iteration: 1 })
        ));
    }
}
