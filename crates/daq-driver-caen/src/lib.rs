//! CAEN VME hardware drivers.
//!
//! Drivers for the CAEN boards of a PMT test stand, built on the bus
//! abstraction of `vme-core`.
//!
//! # Supported Hardware
//!
//! - V1718 (USB) and V2718 (optical link) VME bridges
//! - V1729/V1729A 4 channel 2 GHz sampling ADC
//! - V895 leading edge and V812 constant fraction discriminators
//!
//! # Architecture
//!
//! ## Bridges
//! - [`BridgeModel`] - model table with per-model block limits
//! - [`open_master`] - configure and open a [`BusMaster`](vme_core::BusMaster)
//!
//! ## Digitizer
//! - [`V1729`] - board configuration, acquisition, calibration procedures
//! - [`DigitizerBuffer`] - circular memory decoding into per-channel samples
//! - [`DigitizerCalibration`] - pedestal and vernier data, saved as JSON
//! - [`V1729Model`] - simulated board for the in-memory bridge
//!
//! ## Discriminators
//! - [`Discriminator`] - threshold, width, dead time and majority setup
//!
//! # Example
//!
//! ```
//! use daq_driver_caen::{open_master, DigitizerCalibration, V1729, V1729Model};
//! use serde_json::json;
//! use vme_core::SimulatedBackend;
//!
//! # fn example() -> vme_core::Result<()> {
//! let root = json!({
//!     "bridge": { "model": "V2718", "linkIndex": 0, "boardIndex": 0, "IRQ": ["IRQ1"] },
//!     "ADC": {
//!         "model": "V1729A",
//!         "address": "0x10000000",
//!         "triggerType": "software",
//!         "triggerSettings": ["rising"],
//!         "triggerThreshold": 0,
//!         "preTrig": 10000,
//!         "postTrig": 64,
//!         "samplingFrequency": "2GHz"
//!     }
//! });
//!
//! let bridge = SimulatedBackend::new();
//! V1729Model::new(0x1000_0000).install(&bridge);
//! let master = open_master(&root, "bridge", Box::new(bridge))?;
//!
//! let calibration = V1729::calibrate("ADC", &root, master.clone(), 10)?;
//! let adc = V1729::new("ADC", &root, master, calibration)?;
//! let mut buffer = adc.new_buffer();
//! adc.start_acquisition()?;
//! adc.wait_and_read(&mut buffer)?;
//! println!("integral ch0: {}", buffer.integrate_all(0)?);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod bridge;
pub mod discriminator;
pub mod v1729;

pub use bridge::{open_master, BridgeConfig, BridgeModel, BRIDGE_MODELS};
pub use discriminator::{Discriminator, DiscriminatorModel, ModuleInfo};
pub use v1729::{DigitizerBuffer, DigitizerCalibration, V1729Model, V1729};
