use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use spatial_gmrf::data::load_observations;
use spatial_gmrf::estimate::SpatialModel;
use spatial_gmrf::grid::Grid;
use spatial_gmrf::model::{FitConfig, FittedModel};
use spatial_gmrf::posterior::{FittedRecord, VarianceHessian, VarianceMethod};

#[derive(Parser)]
#[command(
    name = "spatial-gmrf",
    about = "Per-site regressions on a grid, smoothed by a GMRF prior",
    long_about = "Fits y = alpha_s + beta_s * f + noise with log-variance tau_s at every site of a \
                  rectangular grid. The three parameter fields share a 2-D random-walk prior; \
                  the posterior mode is found by damped Newton iteration and summarized by a \
                  Laplace approximation."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the model to an observation table
    #[command(about = "Fit the model (outputs: model.toml, sites.tsv, fitted.tsv)")]
    Fit(FitArgs),
}

#[derive(Args)]
struct FitArgs {
    /// TSV file with columns site, time, observed, covariate (site is 1-based, column-major)
    observations: PathBuf,

    /// Number of grid rows
    #[arg(long)]
    rows: usize,

    /// Number of grid columns
    #[arg(long)]
    cols: usize,

    /// Prior variance scale; required unless given in --config
    #[arg(long)]
    sigma2: Option<f64>,

    /// TOML file with fit settings; command-line flags take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Levenberg-Marquardt damping factor
    #[arg(long)]
    damping: Option<f64>,

    /// Convergence threshold on the mean squared Newton step
    #[arg(long)]
    tolerance: Option<f64>,

    /// Maximum number of Newton iterations
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Read standard deviations from the undamped Hessian at the mode
    #[arg(long)]
    undamped_variance: bool,

    /// Use a dense inverse for standard deviations (small grids only)
    #[arg(long)]
    dense_variance: bool,

    /// Directory for the output files
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

/// A line of `fitted.tsv`, with the site in the 1-based file convention.
#[derive(Serialize)]
struct FittedRow {
    site: usize,
    time: i64,
    observed: f64,
    covariate: f64,
    fitted: f64,
    residual: f64,
}

impl From<&FittedRecord> for FittedRow {
    fn from(record: &FittedRecord) -> Self {
        Self {
            site: record.site + 1,
            time: record.time,
            observed: record.observed,
            covariate: record.covariate,
            fitted: record.fitted,
            residual: record.residual,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fit(args) => fit(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn resolve_config(args: &FitArgs) -> Result<FitConfig, Box<dyn std::error::Error>> {
    let mut config = match (&args.config, args.sigma2) {
        (Some(path), sigma2) => {
            let mut config = FitConfig::load(path)?;
            if let Some(sigma2) = sigma2 {
                config.sigma2 = sigma2;
            }
            config
        }
        (None, Some(sigma2)) => FitConfig::new(sigma2),
        (None, None) => return Err("either --sigma2 or --config must be given".into()),
    };
    if let Some(damping) = args.damping {
        config.damping = damping;
    }
    if let Some(tolerance) = args.tolerance {
        config.tolerance = tolerance;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if args.undamped_variance {
        config.variance_hessian = VarianceHessian::Undamped;
    }
    if args.dense_variance {
        config.variance_method = VarianceMethod::Dense;
    }
    config.validate()?;
    Ok(config)
}

fn fit(args: FitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&args)?;
    let grid = Grid::new(args.rows, args.cols)?;

    println!("Loading observations from: {}", args.observations.display());
    let table = load_observations(&args.observations, &grid)?;
    println!(
        "Loaded {} records on a {}x{} grid",
        table.len(),
        grid.rows(),
        grid.cols()
    );

    let model = SpatialModel::new(grid)?;
    let fitted = model.fit(&table, &config)?;
    println!(
        "Converged in {} iterations (mean squared step {:.3e}, gradient norm {:.3e})",
        fitted.iterations, fitted.final_step_msq, fitted.gradient_norm
    );
    if !fitted.stationary {
        println!(
            "Warning: the estimates are not a stationary point (undamped mean squared step {:.3e}); \
             try a larger --sigma2, a smaller --damping or a smaller --tolerance",
            fitted.undamped_step_msq
        );
    }
    if !fitted.prior_only_sites.is_empty() {
        println!(
            "Sites without records (prior only): {:?}",
            fitted
                .prior_only_sites
                .iter()
                .map(|site| site + 1)
                .collect::<Vec<_>>()
        );
    }

    fs::create_dir_all(&args.out_dir)?;
    let model_path = args.out_dir.join("model.toml");
    fitted.save(&model_path)?;
    write_sites(&args.out_dir.join("sites.tsv"), &fitted)?;
    let rows: Vec<FittedRow> = fitted
        .fitted_values(&table)
        .iter()
        .map(FittedRow::from)
        .collect();
    write_tsv(&args.out_dir.join("fitted.tsv"), &rows)?;

    println!("Model saved to: {}", model_path.display());
    Ok(())
}

fn write_sites(path: &Path, fitted: &FittedModel) -> Result<(), Box<dyn std::error::Error>> {
    write_tsv(path, &fitted.site_estimates())
}

fn write_tsv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
