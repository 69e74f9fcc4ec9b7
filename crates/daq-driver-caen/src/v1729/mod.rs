//! CAEN V1729/V1729A 4 channel 2 GHz sampling ADC.
//!
//! - [`spec`] - geometry, register map and settings tables
//! - [`board`] - configuration, acquisition and calibration procedures
//! - [`buffer`] - circular memory decoding
//! - [`calibration`] - pedestal and vernier data
//! - [`simulation`] - board model for the simulated bridge

pub mod board;
pub mod buffer;
pub mod calibration;
pub mod simulation;
pub mod spec;

pub use board::{DigitizerSetup, V1729};
pub use buffer::{ChannelIter, ChannelView, DigitizerBuffer};
pub use calibration::DigitizerCalibration;
pub use simulation::V1729Model;
pub use spec::{Submodel, N_CHANNELS, SAMPLES_PER_CHANNEL};
