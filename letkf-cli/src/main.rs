use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use letkf::config::RunConfig;
use letkf::driver::AssimilationDriver;
use letkf::error::Error;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Localized Ensemble Transform Kalman Filter driver for ensemble chemical
/// data assimilation.
#[derive(Parser)]
#[command(name = "letkf", version)]
struct Cli {
    /// Path to the YAML or JSON run configuration.
    #[arg(long, global = true, default_value = "ens_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write initial emission scaling-factor files for every ensemble member.
    InitializeScalingFactors {
        /// Start date, `YYYYMMDD`.
        date: String,
        /// RNG seed; omit for entropy-seeded (non-reproducible) draws.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run the sweep phase for one (ensnum, corenum) column partition.
    Run {
        ensnum: u32,
        corenum: u32,
        timestamp: String,
        /// Total number of cores the column domain is partitioned across.
        #[arg(long, default_value_t = 1)]
        n_cores: u32,
        /// Also run the gather phase once the sweep completes.
        #[arg(long)]
        gather: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::from(0),
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::Config { .. } | Error::Unimplemented | Error::Yaml(_) | Error::Json(_) => 1,
        Error::InputShape { .. } | Error::Observation { .. } => 2,
        Error::Numeric { .. } => 3,
        Error::MissingShard { .. } => 4,
        Error::Io { .. } | Error::NetCdf { .. } => 5,
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let config = Arc::new(RunConfig::load(&cli.config)?);

    match cli.command {
        Command::InitializeScalingFactors { date, seed } => initialize_scaling_factors(&config, &date, seed),
        Command::Run {
            ensnum,
            corenum,
            timestamp,
            n_cores,
            gather,
        } => {
            let driver = AssimilationDriver::new(Arc::clone(&config))?;
            let (nature, mut members) = driver.load_members(&timestamp)?;
            let observations = driver.synthesize_observations(&nature)?;

            driver.sweep(ensnum, corenum, n_cores, &timestamp, &members, &observations)?;

            if gather {
                driver.gather(ensnum, n_cores, &timestamp, &mut members)?;
            }
            Ok(())
        }
    }
}

fn initialize_scaling_factors(config: &RunConfig, date: &str, seed: Option<u64>) -> Result<(), Error> {
    let mut rng: Box<dyn rand::RngCore> = match seed {
        Some(s) => Box::new(rand::rngs::StdRng::seed_from_u64(s)),
        None => Box::new(rand::rngs::StdRng::from_entropy()),
    };

    let grid = letkf::grid::GridSpec::new(&config.grid_tag)?;
    let dir = config.ensemble_dir();

    let mut member_dirs = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(|e| Error::io(dir.as_path(), e))? {
        let entry = entry.map_err(|e| Error::io(dir.as_path(), e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == "logs" || name == format!("{}_000", config.run_name) {
            continue;
        }
        member_dirs.push(path);
    }

    // One perturbation draw per species, reused across every member
    // directory (matching `initialize_scaling_factors.py`, which draws
    // `scaling_factors` once and writes the same field to every member).
    for species in &config.control_vector_emis {
        let p = config.p_pert;
        let draws = ndarray::Array2::from_shape_fn((grid.nlat(), grid.nlon()), |_| 1.0 - p + rng.gen::<f64>() * (2.0 * p));
        for path in &member_dirs {
            let sf_path = path.join(format!("{species}_SCALEFACTOR.nc"));
            write_initial_scalefactor(&sf_path, &draws)?;
        }
    }
    tracing::info!(date, "wrote initial scaling factors");
    Ok(())
}

fn write_initial_scalefactor(path: &std::path::Path, values: &ndarray::Array2<f64>) -> Result<(), Error> {
    let (nlat, nlon) = (values.shape()[0], values.shape()[1]);
    let mut file = netcdf::create(path).map_err(|e| Error::netcdf(path, e))?;
    file.add_dimension("time", 1).map_err(|e| Error::netcdf(path, e))?;
    file.add_dimension("lat", nlat).map_err(|e| Error::netcdf(path, e))?;
    file.add_dimension("lon", nlon).map_err(|e| Error::netcdf(path, e))?;

    let mut scalar = file
        .add_variable::<f64>("Scalar", &["time", "lat", "lon"])
        .map_err(|e| Error::netcdf(path, e))?;
    scalar.put_attribute("units", "1").map_err(|e| Error::netcdf(path, e))?;
    scalar
        .put_values(values.as_slice().unwrap(), ..)
        .map_err(|e| Error::netcdf(path, e))?;

    let mut time_var = file.add_variable::<f64>("time", &["time"]).map_err(|e| Error::netcdf(path, e))?;
    time_var
        .put_attribute("units", "hours since START_DATE 00:00:00")
        .map_err(|e| Error::netcdf(path, e))?;
    time_var.put_values(&[0.0_f64], ..).map_err(|e| Error::netcdf(path, e))?;

    file.add_attribute("Conventions", "COARDS").map_err(|e| Error::netcdf(path, e))
}
