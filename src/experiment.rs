//! PMT test stand experiment.
//!
//! One bridge (`bridge`) and one V1729A (`ADC`) driven by the `experiment`
//! section of the settings tree:
//!
//! | Key | Meaning | Default |
//! |-----|---------|---------|
//! | `name` | experiment name, selects `defaults.<name>` | required |
//! | `calibrationDirectory` | where calibrations are written and read | required |
//! | `outputDirectory` | run output, must not exist yet | required |
//! | `nPulses` | full waveforms recorded | required |
//! | `nIntegratedPulses` | pulses recorded as integrals only | required |
//! | `integrationRange` | `[first, last)` sample window | required |
//! | `nPedestal` | acquisitions averaged for the pedestal | 100 |
//!
//! [`calibrate`] writes `pedestal.json` and `vernier.json` into the
//! calibration directory; [`acquire`] writes `pulses.csv`, `integrals.csv`
//! and the merged `settings.json` into the output directory.

use std::fs::{self, File};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, info_span};
use vme_core::slave::read_address;
use vme_core::{BusBackend, ConfigError, Settings, SimulatedBackend};

use daq_driver_caen::v1729::{DigitizerBuffer, N_CHANNELS, SAMPLES_PER_CHANNEL};
use daq_driver_caen::{BridgeConfig, DigitizerCalibration, V1729Model, V1729};

/// Settings section of the experiment.
pub const EXPERIMENT_KEY: &str = "experiment";
/// Settings name of the bridge.
pub const MASTER_NAME: &str = "bridge";
/// Settings name of the digitizer.
pub const ADC_NAME: &str = "ADC";
/// Waveform output file.
pub const PULSES_FILE: &str = "pulses.csv";
/// Integral output file.
pub const INTEGRALS_FILE: &str = "integrals.csv";
/// Settings snapshot of a run.
pub const SETTINGS_FILE: &str = "settings.json";

const NAME_KEY: &str = "name";
const CALIBRATION_KEY: &str = "calibrationDirectory";
const OUTDIR_KEY: &str = "outputDirectory";
const N_PULSES_KEY: &str = "nPulses";
const N_INTEGRALS_KEY: &str = "nIntegratedPulses";
const INTEGRATION_RANGE_KEY: &str = "integrationRange";
const N_PEDESTAL_KEY: &str = "nPedestal";
const DEFAULT_N_PEDESTAL: usize = 100;

/// Resolved `experiment` section.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Experiment name.
    pub name: String,
    /// Calibration directory.
    pub calibration_directory: PathBuf,
    /// Run output directory.
    pub output_directory: PathBuf,
    /// Waveforms to record.
    pub n_pulses: usize,
    /// Integrals to record.
    pub n_integrated_pulses: usize,
    /// Integration window in samples.
    pub integration_range: Range<usize>,
    /// Pedestal acquisitions.
    pub n_pedestal: usize,
    settings: Settings,
}

impl ExperimentConfig {
    /// Read the `experiment` section of `root`.
    pub fn from_tree(root: &Value) -> std::result::Result<Self, ConfigError> {
        let mut settings = Settings::load_keyed(root, EXPERIMENT_KEY, NAME_KEY)?;
        let name: String = settings.get(NAME_KEY)?;
        let calibration_directory: PathBuf = settings.get(CALIBRATION_KEY)?;
        let output_directory: PathBuf = settings.get(OUTDIR_KEY)?;
        let n_pulses: usize = settings.get(N_PULSES_KEY)?;
        let n_integrated_pulses: usize = settings.get(N_INTEGRALS_KEY)?;
        let n_pedestal: usize = settings.get_or(N_PEDESTAL_KEY, DEFAULT_N_PEDESTAL)?;

        let range: Vec<usize> = settings.get_vec(INTEGRATION_RANGE_KEY)?;
        let integration_range = match range[..] {
            [start, end] if start < end && end <= SAMPLES_PER_CHANNEL => start..end,
            _ => return Err(settings.value_error(INTEGRATION_RANGE_KEY, format!("{range:?}"))),
        };

        Ok(Self {
            name,
            calibration_directory,
            output_directory,
            n_pulses,
            n_integrated_pulses,
            integration_range,
            n_pedestal,
            settings,
        })
    }

    /// Override the number of waveforms.
    pub fn with_pulses(mut self, n_pulses: usize) -> Self {
        self.n_pulses = n_pulses;
        self
    }

    /// Override the number of integrated pulses.
    pub fn with_integrated_pulses(mut self, n: usize) -> Self {
        self.n_integrated_pulses = n;
        self
    }

    /// Create `path` for `key`, refusing to reuse an existing directory.
    fn create_fresh_directory(&self, key: &str, path: &Path) -> Result<()> {
        if path.exists() {
            return Err(self.settings.value_error(key, path.display()).into());
        }
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))
    }
}

/// Waveform sample row of `pulses.csv`.
#[derive(Debug, Serialize)]
struct PulseRow {
    event: usize,
    sample: usize,
    channel0: i32,
    channel1: i32,
    channel2: i32,
    channel3: i32,
}

/// Integral row of `integrals.csv`.
#[derive(Debug, Serialize)]
struct IntegralRow {
    event: usize,
    channel0: i64,
    channel1: i64,
    channel2: i64,
    channel3: i64,
}

/// Outcome of [`acquire`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Output directory.
    pub output_directory: PathBuf,
    /// Waveforms written.
    pub pulses: usize,
    /// Integrals written.
    pub integrals: usize,
    /// Mean integral per channel, positive for negative pulses.
    pub mean_integrals: [f64; N_CHANNELS],
}

/// In-memory bridge with a V1729 model at the `ADC` address of `root`.
pub fn simulated_bridge(root: &Value, noise: u16) -> std::result::Result<SimulatedBackend, ConfigError> {
    let settings = Settings::load(root, ADC_NAME)?;
    let base = read_address(&settings, "address")?;
    let bridge = SimulatedBackend::new();
    V1729Model::new(base).with_noise(noise).install(&bridge);
    Ok(bridge)
}

/// Measure the pedestal and the verniers and save them into the
/// calibration directory.
pub fn calibrate(root: &Value, backend: Box<dyn BusBackend>) -> Result<DigitizerCalibration> {
    let config = ExperimentConfig::from_tree(root)?;
    let span = info_span!("experiment", name = %config.name);
    let _entered = span.enter();

    config.create_fresh_directory(CALIBRATION_KEY, &config.calibration_directory)?;
    let master = BridgeConfig::from_tree(root, MASTER_NAME)?
        .open(backend)
        .context("Failed to open the VME bridge")?;

    info!(n_pedestal = config.n_pedestal, "Generating calibrations");
    let calibration = V1729::calibrate(ADC_NAME, root, master, config.n_pedestal)?;
    calibration.save(&config.calibration_directory)?;
    info!(
        directory = %config.calibration_directory.display(),
        "Calibrations complete"
    );
    Ok(calibration)
}

/// Record waveforms and integrals with the saved calibration.
pub fn acquire(root: &Value, backend: Box<dyn BusBackend>) -> Result<RunSummary> {
    run(ExperimentConfig::from_tree(root)?, root, backend)
}

/// [`acquire`] with an already resolved configuration.
pub fn run(
    config: ExperimentConfig,
    root: &Value,
    backend: Box<dyn BusBackend>,
) -> Result<RunSummary> {
    let span = info_span!("experiment", name = %config.name);
    let _entered = span.enter();

    let calibration = DigitizerCalibration::load(&config.calibration_directory).with_context(|| {
        format!(
            "No usable calibration in {}",
            config.calibration_directory.display()
        )
    })?;
    config.create_fresh_directory(OUTDIR_KEY, &config.output_directory)?;

    let bridge = BridgeConfig::from_tree(root, MASTER_NAME)?;
    let master = bridge.open(backend).context("Failed to open the VME bridge")?;
    let adc = V1729::new(ADC_NAME, root, Arc::clone(&master), calibration)?;
    info!("Experiment initialized");

    let mut buffer = adc.new_buffer();
    adc.start_acquisition()?;

    info!(n_pulses = config.n_pulses, "Measuring pulses");
    measure_pulses(&config, &adc, &mut buffer)?;

    info!(n_integrals = config.n_integrated_pulses, "Measuring integrated pulses");
    let sums = measure_integrals(&config, &adc, &mut buffer)?;

    let mut snapshot = json!({});
    config.settings.save(&mut snapshot);
    bridge.settings.save(&mut snapshot);
    adc.save_settings(&mut snapshot);
    let settings_path = config.output_directory.join(SETTINGS_FILE);
    let text = serde_json::to_string_pretty(&snapshot)?;
    fs::write(&settings_path, text)
        .with_context(|| format!("Failed to write {}", settings_path.display()))?;
    info!("Experiment done, output files closed");

    let n = config.n_integrated_pulses.max(1) as f64;
    Ok(RunSummary {
        output_directory: config.output_directory.clone(),
        pulses: config.n_pulses,
        integrals: config.n_integrated_pulses,
        mean_integrals: sums.map(|sum| sum as f64 / n),
    })
}

fn measure_pulses(config: &ExperimentConfig, adc: &V1729, buffer: &mut DigitizerBuffer) -> Result<()> {
    let path = config.output_directory.join(PULSES_FILE);
    let mut writer = csv::Writer::from_writer(
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    for event in 0..config.n_pulses {
        adc.wait_and_read(buffer)?;
        let channels = [
            buffer.channel(0)?,
            buffer.channel(1)?,
            buffer.channel(2)?,
            buffer.channel(3)?,
        ];
        for sample in 0..SAMPLES_PER_CHANNEL {
            writer.serialize(PulseRow {
                event,
                sample,
                channel0: channels[0].get(sample)?,
                channel1: channels[1].get(sample)?,
                channel2: channels[2].get(sample)?,
                channel3: channels[3].get(sample)?,
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn measure_integrals(
    config: &ExperimentConfig,
    adc: &V1729,
    buffer: &mut DigitizerBuffer,
) -> Result<[i64; N_CHANNELS]> {
    let path = config.output_directory.join(INTEGRALS_FILE);
    let mut writer = csv::Writer::from_writer(
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?,
    );
    let mut sums = [0i64; N_CHANNELS];
    for event in 0..config.n_integrated_pulses {
        adc.wait_and_read(buffer)?;
        let mut integrals = [0i64; N_CHANNELS];
        for (channel, integral) in integrals.iter_mut().enumerate() {
            // pulses are negative
            *integral = -buffer.integrate(channel, config.integration_range.clone())?;
            sums[channel] += *integral;
        }
        writer.serialize(IntegralRow {
            event,
            channel0: integrals[0],
            channel1: integrals[1],
            channel2: integrals[2],
            channel3: integrals[3],
        })?;
    }
    writer.flush()?;
    Ok(sums)
}
