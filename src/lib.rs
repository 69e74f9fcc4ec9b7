//! # VME DAQ
//!
//! Application layer of the VME acquisition stack. The bus abstraction lives
//! in `vme-core` and the CAEN board drivers in `daq-driver-caen`; this crate
//! ties them together for the PMT test stand.
//!
//! ## Crate Structure
//!
//! - **`config`**: Loads settings trees from JSON or TOML files with `figment`.
//! - **`logging`**: Installs the `tracing` subscriber (pretty, compact or JSON output).
//! - **`experiment`**: Calibration and acquisition runs writing CSV output and a
//!   settings snapshot.

pub mod config;
pub mod experiment;
pub mod logging;

pub use experiment::{acquire, calibrate, ExperimentConfig, RunSummary};
