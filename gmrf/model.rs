use crate::data::ObservationTable;
use crate::grid::{Grid, GridError};
use crate::posterior::{FittedRecord, PosteriorSummary, VarianceHessian, VarianceMethod};
use crate::precision::Field;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

fn default_damping() -> f64 {
    1.0
}

fn default_tolerance() -> f64 {
    1e-4
}

fn default_max_iterations() -> usize {
    100
}

/// Settings of a single fit. Only `sigma2` has no default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FitConfig {
    /// Prior variance scale shared by the three fields.
    pub sigma2: f64,
    /// Levenberg–Marquardt factor; the Hessian diagonal is scaled by `1 + damping`.
    #[serde(default = "default_damping")]
    pub damping: f64,
    /// Threshold on the mean squared Newton step.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub variance_hessian: VarianceHessian,
    #[serde(default)]
    pub variance_method: VarianceMethod,
}

/// Rejected settings, detected before any iteration runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("sigma2 must be finite and strictly positive, got {0}")]
    NonPositiveSigma2(f64),
    #[error("damping must be finite and non-negative, got {0}")]
    NegativeDamping(f64),
    #[error("tolerance must be finite and strictly positive, got {0}")]
    NonPositiveTolerance(f64),
    #[error("max_iterations must be at least 1")]
    ZeroMaxIterations,
}

impl FitConfig {
    pub fn new(sigma2: f64) -> Self {
        Self {
            sigma2,
            damping: default_damping(),
            tolerance: default_tolerance(),
            max_iterations: default_max_iterations(),
            variance_hessian: VarianceHessian::default(),
            variance_method: VarianceMethod::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sigma2.is_finite() && self.sigma2 > 0.0) {
            return Err(ConfigError::NonPositiveSigma2(self.sigma2));
        }
        if !(self.damping.is_finite() && self.damping >= 0.0) {
            return Err(ConfigError::NegativeDamping(self.damping));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::NonPositiveTolerance(self.tolerance));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroMaxIterations);
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ModelError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }
}

/// Error type for reading and writing configuration and model files.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model has {found} sites but its grid has {expected}")]
    MismatchedSiteCount { found: usize, expected: usize },
}

/// The self-contained result of a fit, saved to and loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub grid: Grid,
    pub config: FitConfig,
    pub iterations: usize,
    pub final_step_msq: f64,
    /// Gradient norm at the reported mode.
    pub gradient_norm: f64,
    /// Mean squared undamped Newton step from the reported mode.
    pub undamped_step_msq: f64,
    /// False when the damped steps became short before the gradient vanished.
    pub stationary: bool,
    /// Log-density at the reported mode.
    pub log_density: f64,
    /// Zero-based sites without any record; their estimates come from the prior alone.
    pub prior_only_sites: Vec<usize>,
    pub summary: PosteriorSummary,
}

/// One line of the per-site result table, in the 1-based file convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiteEstimate {
    pub site: usize,
    pub row: usize,
    pub col: usize,
    pub alpha: f64,
    pub alpha_sd: f64,
    pub beta: f64,
    pub beta_sd: f64,
    pub tau: f64,
    pub tau_sd: f64,
}

impl FittedModel {
    /// Per-site mode and standard deviation, ordered by site.
    pub fn site_estimates(&self) -> Vec<SiteEstimate> {
        let s = &self.summary;
        (0..s.site_count())
            .map(|site| {
                let (row, col) = self.grid.coords_of(site);
                SiteEstimate {
                    site: site + 1,
                    row: row + 1,
                    col: col + 1,
                    alpha: s.alpha[site],
                    alpha_sd: s.alpha_sd[site],
                    beta: s.beta[site],
                    beta_sd: s.beta_sd[site],
                    tau: s.tau[site],
                    tau_sd: s.tau_sd[site],
                }
            })
            .collect()
    }

    pub fn fitted_values(&self, table: &ObservationTable) -> Vec<FittedRecord> {
        self.summary.fitted_values(table)
    }

    /// The mode as a latent vector, usable as a warm start.
    pub fn mode_vector(&self) -> Array1<f64> {
        self.summary.mode_vector()
    }

    pub fn field(&self, field: Field) -> (&Array1<f64>, &Array1<f64>) {
        (self.summary.mode(field), self.summary.sd(field))
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file and checks it against its own grid.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: FittedModel = toml::from_str(&toml_string)?;
        let expected = model.grid.site_count();
        for field in Field::ALL {
            let (mode, sd) = model.field(field);
            for found in [mode.len(), sd.len()] {
                if found != expected {
                    return Err(ModelError::MismatchedSiteCount { found, expected });
                }
            }
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::NamedTempFile;

    fn tiny_model() -> FittedModel {
        FittedModel {
            grid: Grid::new(2, 2).unwrap(),
            config: FitConfig::new(0.5),
            iterations: 7,
            final_step_msq: 3.5e-5,
            gradient_norm: 0.125,
            undamped_step_msq: 5.0e-5,
            stationary: true,
            log_density: -12.25,
            prior_only_sites: vec![3],
            summary: PosteriorSummary {
                alpha: array![0.5, 0.4, 0.6, 0.5],
                beta: array![2.0, 1.9, 2.1, 2.0],
                tau: array![-1.0, -1.1, -0.9, -1.0],
                alpha_sd: array![0.1, 0.1, 0.1, 0.3],
                beta_sd: array![0.2, 0.2, 0.2, 0.4],
                tau_sd: array![0.3, 0.3, 0.3, 0.5],
            },
        }
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config = FitConfig::from_toml_str("sigma2 = 0.25\n").unwrap();
        assert_eq!(config, FitConfig::new(0.25));
        assert_eq!(config.damping, 1.0);
        assert_eq!(config.tolerance, 1e-4);
        assert_eq!(config.max_iterations, 100);
        assert_eq!(config.variance_hessian, VarianceHessian::Damped);
        assert_eq!(config.variance_method, VarianceMethod::SelectedInverse);
    }

    #[test]
    fn config_reads_every_option() {
        let text = r#"
            sigma2 = 2.0
            damping = 0.5
            tolerance = 1e-8
            max_iterations = 40
            variance_hessian = "undamped"
            variance_method = "dense"
        "#;
        let config = FitConfig::from_toml_str(text).unwrap();
        assert_eq!(config.damping, 0.5);
        assert_eq!(config.max_iterations, 40);
        assert_eq!(config.variance_hessian, VarianceHessian::Undamped);
        assert_eq!(config.variance_method, VarianceMethod::Dense);
    }

    #[test]
    fn config_rejects_unknown_and_missing_keys() {
        assert!(FitConfig::from_toml_str("sigma2 = 1.0\nlambda = 2.0\n").is_err());
        assert!(FitConfig::from_toml_str("damping = 2.0\n").is_err());
    }

    #[test]
    fn validation_catches_each_bad_setting() {
        assert_eq!(
            FitConfig::new(0.0).validate(),
            Err(ConfigError::NonPositiveSigma2(0.0))
        );
        assert!(matches!(
            FitConfig::new(f64::NAN).validate(),
            Err(ConfigError::NonPositiveSigma2(_))
        ));
        let base = FitConfig::new(1.0);
        assert!(base.validate().is_ok());
        let bad_damping = FitConfig { damping: -0.1, ..base.clone() };
        assert_eq!(bad_damping.validate(), Err(ConfigError::NegativeDamping(-0.1)));
        let bad_tol = FitConfig { tolerance: 0.0, ..base.clone() };
        assert_eq!(bad_tol.validate(), Err(ConfigError::NonPositiveTolerance(0.0)));
        let bad_iter = FitConfig { max_iterations: 0, ..base.clone() };
        assert_eq!(bad_iter.validate(), Err(ConfigError::ZeroMaxIterations));
        let undamped = FitConfig { damping: 0.0, ..base };
        assert!(undamped.validate().is_ok());
    }

    #[test]
    fn save_load_round_trip() {
        let model = tiny_model();
        let file = NamedTempFile::new().unwrap();
        model.save(file.path()).unwrap();
        let loaded = FittedModel::load(file.path()).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn load_rejects_summary_of_the_wrong_size() {
        let mut model = tiny_model();
        model.summary.beta_sd = array![0.2, 0.2];
        let file = NamedTempFile::new().unwrap();
        model.save(file.path()).unwrap();
        assert!(matches!(
            FittedModel::load(file.path()),
            Err(ModelError::MismatchedSiteCount { found: 2, expected: 4 })
        ));
    }

    #[test]
    fn load_rejects_a_degenerate_grid() {
        let text = toml::to_string_pretty(&tiny_model())
            .unwrap()
            .replacen("rows = 2", "rows = 1", 1);
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), text).unwrap();
        assert!(matches!(
            FittedModel::load(file.path()),
            Err(ModelError::TomlParseError(_))
        ));
    }

    #[test]
    fn site_estimates_use_one_based_coordinates() {
        let estimates = tiny_model().site_estimates();
        assert_eq!(estimates.len(), 4);
        let last = estimates[3];
        assert_eq!((last.site, last.row, last.col), (4, 2, 2));
        assert_eq!(estimates[1].row, 2);
        assert_eq!(estimates[1].col, 1);
        assert_eq!(estimates[2].alpha, 0.6);
        assert_eq!(last.tau_sd, 0.5);
    }
}
