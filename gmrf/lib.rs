//! Per-site linear regressions on a rectangular lattice, smoothed by a
//! Gaussian Markov random field prior, fitted by damped Newton iteration
//! and summarized by a Laplace approximation.

pub mod data;
pub mod estimate;
pub mod faer_ndarray;
pub mod grid;
pub mod model;
pub mod newton;
pub mod objective;
pub mod posterior;
pub mod precision;
pub mod selected_inverse;
pub mod sparse;

pub use data::{Observation, ObservationTable, load_observations};
pub use estimate::{EstimationError, NumericalError, SpatialModel};
pub use grid::Grid;
pub use model::{ConfigError, FitConfig, FittedModel};
pub use posterior::{PosteriorSummary, VarianceHessian, VarianceMethod};
