//! CLI Entry Point for vme-daq
//!
//! Runs the PMT test stand experiment:
//! - `calibrate`: measure pedestal and verniers into the calibration directory
//! - `acquire`: record waveforms and integrals into a fresh output directory
//!
//! The vendor bridge library is not linked; both commands run against the
//! in-memory bridge with a simulated V1729 at the configured ADC address.
//!
//! # Usage
//!
//! ```bash
//! vme-daq --log-level debug calibrate --config config/example.json
//! vme-daq acquire --config config/example.json --pulses 10
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use vme_daq::config::load_tree;
use vme_daq::experiment::{self, ExperimentConfig};
use vme_daq::logging::{self, parse_log_level, LoggingConfig, OutputFormat};

#[derive(Parser)]
#[command(name = "vme-daq")]
#[command(about = "VME data acquisition for CAEN digitizers", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure the digitizer pedestal and verniers
    Calibrate {
        /// Experiment configuration (JSON or TOML)
        #[arg(long)]
        config: PathBuf,

        /// Baseline noise of the simulated digitizer, in counts
        #[arg(long, default_value = "2")]
        noise: u16,
    },

    /// Record pulses with a saved calibration
    Acquire {
        /// Experiment configuration (JSON or TOML)
        #[arg(long)]
        config: PathBuf,

        /// Override `nPulses`
        #[arg(long)]
        pulses: Option<usize>,

        /// Override `nIntegratedPulses`
        #[arg(long)]
        integrals: Option<usize>,

        /// Baseline noise of the simulated digitizer, in counts
        #[arg(long, default_value = "2")]
        noise: u16,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match parse_log_level(&cli.log_level) {
        Ok(level) => level,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(message) = logging::init(LoggingConfig::new(level).with_format(cli.log_format)) {
        eprintln!("{message}");
        return ExitCode::FAILURE;
    }

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Calibrate { config, noise } => {
            let tree = load_tree(&config)
                .with_context(|| format!("Failed to read {}", config.display()))?;
            let bridge = experiment::simulated_bridge(&tree, noise)?;
            experiment::calibrate(&tree, Box::new(bridge))?;
            info!("Calibrations complete, exiting");
            Ok(())
        }
        Commands::Acquire {
            config,
            pulses,
            integrals,
            noise,
        } => {
            let tree = load_tree(&config)
                .with_context(|| format!("Failed to read {}", config.display()))?;
            let mut settings = ExperimentConfig::from_tree(&tree)?;
            if let Some(pulses) = pulses {
                settings = settings.with_pulses(pulses);
            }
            if let Some(integrals) = integrals {
                settings = settings.with_integrated_pulses(integrals);
            }
            let bridge = experiment::simulated_bridge(&tree, noise)?;
            let summary = experiment::run(settings, &tree, Box::new(bridge))?;
            info!(
                output = %summary.output_directory.display(),
                pulses = summary.pulses,
                integrals = summary.integrals,
                mean_integrals = ?summary.mean_integrals,
                "Run complete"
            );
            Ok(())
        }
    }
}
