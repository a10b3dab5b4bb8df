//! # Fitting the smoothed per-site regression
//!
//! This module ties the pieces together. For one grid shape the prior
//! precision is built once and shared; every fit then
//!
//! 1.  validates the configuration and groups the observations by site,
//! 2.  runs the damped Newton iteration to the posterior mode, and
//! 3.  reads marginal standard deviations off the Laplace approximation.
//!
//! Configuration and data problems are reported before any iteration runs.
//! Numerical failures abort the fit without returning a partial mode.

use crate::data::{DataError, GroupedObservations, ObservationTable};
use crate::grid::{Grid, GridError};
use crate::model::{ConfigError, FitConfig, FittedModel};
use crate::newton::{ModeResult, find_mode_from};
use crate::posterior::{PosteriorSummary, VarianceHessian};
use crate::precision::{PrecisionError, PrecisionMatrices};
use crate::sparse::SparseError;
use ndarray::Array1;
use rayon::prelude::*;
use std::sync::Arc;
use thiserror::Error;

/// Failures of the linear algebra behind a fit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericalError {
    #[error("The damped negative Hessian is not positive definite at iteration {iteration}.")]
    NotPositiveDefinite { iteration: usize },
    #[error("The log-density or its derivatives became non-finite at iteration {iteration}.")]
    NonFiniteObjective { iteration: usize },
    #[error("The Newton step became non-finite at iteration {iteration}.")]
    NonFiniteStep { iteration: usize },
    #[error("Sparse matrix assembly failed: {0}")]
    Assembly(SparseError),
    #[error("The posterior precision is not positive definite (band pivot {pivot}).")]
    PosteriorNotPositiveDefinite { pivot: usize },
    #[error("Dense inverse of the posterior precision failed: {0}")]
    DenseInverseFailed(String),
    #[error("Posterior variance of latent entry {index} is not positive: {value}")]
    NonPositiveVariance { index: usize, value: f64 },
}

/// A comprehensive error type for the fitting process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimationError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Invalid observations: {0}")]
    Data(#[from] DataError),

    #[error("Numerical failure: {0}")]
    Numerical(#[from] NumericalError),

    #[error(
        "The Newton iteration did not converge within {max_iterations} iterations. Last mean squared step was {last_step_msq:.6e}."
    )]
    DidNotConverge {
        max_iterations: usize,
        last_step_msq: f64,
    },
}

impl From<GridError> for EstimationError {
    fn from(err: GridError) -> Self {
        EstimationError::Configuration(err.into())
    }
}

impl From<PrecisionError> for EstimationError {
    fn from(err: PrecisionError) -> Self {
        match err {
            PrecisionError::Grid(e) => e.into(),
            PrecisionError::Sparse(e) => NumericalError::Assembly(e).into(),
        }
    }
}

/// Fits observation tables on one grid shape, reusing a single prior precision.
#[derive(Debug, Clone)]
pub struct SpatialModel {
    precision: Arc<PrecisionMatrices>,
}

impl SpatialModel {
    pub fn new(grid: Grid) -> Result<Self, EstimationError> {
        Ok(Self {
            precision: Arc::new(PrecisionMatrices::build(grid)?),
        })
    }

    pub fn for_shape(rows: usize, cols: usize) -> Result<Self, EstimationError> {
        Self::new(Grid::new(rows, cols)?)
    }

    pub fn grid(&self) -> &Grid {
        self.precision.grid()
    }

    pub fn precision(&self) -> &Arc<PrecisionMatrices> {
        &self.precision
    }

    /// Fits from the zero vector.
    pub fn fit(
        &self,
        table: &ObservationTable,
        config: &FitConfig,
    ) -> Result<FittedModel, EstimationError> {
        self.fit_from(table, config, Array1::zeros(3 * self.grid().site_count()))
    }

    /// Fits from a caller-supplied latent vector `[alpha, beta, tau]`.
    pub fn fit_from(
        &self,
        table: &ObservationTable,
        config: &FitConfig,
        start: Array1<f64>,
    ) -> Result<FittedModel, EstimationError> {
        config.validate()?;
        let grid = *self.grid();
        let data = GroupedObservations::new(table, &grid)?;

        let prior_only_sites = data.empty_sites();
        if !prior_only_sites.is_empty() {
            log::warn!(
                "{} of {} sites have no records; their estimates come from the prior alone",
                prior_only_sites.len(),
                grid.site_count()
            );
        }
        if !data.is_complete_panel() {
            log::warn!(
                "Observation panel is incomplete: not every site has all {} periods",
                data.distinct_times()
            );
        }
        log::info!(
            "Fitting {}x{} grid: {} records over {} periods, sigma2 = {}",
            grid.rows(),
            grid.cols(),
            table.len(),
            data.distinct_times(),
            config.sigma2
        );

        let ModeResult {
            mode,
            hessian,
            curvature,
            iterations,
            final_step_msq,
            objective,
            gradient_norm,
            undamped_step_msq,
            stationary,
        } = find_mode_from(start, &data, &self.precision, config)?;

        let variance_hessian = match config.variance_hessian {
            VarianceHessian::Damped => hessian,
            VarianceHessian::Undamped => curvature,
        };
        let summary =
            PosteriorSummary::from_mode(mode.view(), &variance_hessian, config.variance_method)?;

        Ok(FittedModel {
            grid,
            config: config.clone(),
            iterations,
            final_step_msq,
            gradient_norm,
            undamped_step_msq,
            stationary,
            log_density: objective,
            prior_only_sites,
            summary,
        })
    }

    /// Fits independent tables concurrently. Results keep the input order.
    pub fn fit_many(
        &self,
        tables: &[ObservationTable],
        config: &FitConfig,
    ) -> Vec<Result<FittedModel, EstimationError>> {
        tables
            .par_iter()
            .map(|table| self.fit(table, config))
            .collect()
    }
}
