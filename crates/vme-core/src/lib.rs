//! VME64 bus abstraction for data acquisition hardware.
//!
//! This crate models the bus side of a VME data acquisition setup: the
//! addressing/transfer mode algebra of VME64/VME64x, a bus master that owns
//! one controller session, and slave handles that address devices relative
//! to their base address. Device drivers (digitizers, discriminators) are
//! built on top of [`BusSlave`].
//!
//! # Architecture
//!
//! ## Protocol tables
//! - [`AddressingMode`] / [`TransferMode`] - enumerated bus modes
//! - [`ModeSet`] - validated mode combination of one device
//!
//! ## Bus access
//! - [`BusBackend`] - capability interface a bridge driver implements
//! - [`BusMaster`] - controller session, chunked block transfers, IRQ waits
//! - [`BusSlave`] - base-address relative forwarding to a shared master
//!
//! ## Configuration
//! - [`Settings`] - settings subtree with model defaults fallback
//! - [`Translator`] - string to value tables for enumerated settings
//!
//! ## Testing
//! - [`SimulatedBackend`] - in-memory bridge with fault injection
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use vme_core::{
//!     AddressingMode, BusMaster, BusSlave, MasterConfig, ModeSet, SimulatedBackend,
//!     TransferMode,
//! };
//!
//! # fn example() -> vme_core::Result<()> {
//! let bridge = SimulatedBackend::new();
//! let master = Arc::new(BusMaster::open(MasterConfig::new("bridge"), Box::new(bridge))?);
//!
//! let modes = ModeSet::new(AddressingMode::A32, TransferMode::D32, TransferMode::Mblt)?;
//! let adc = BusSlave::new("adc", master, 0x1000_0000, modes)?;
//! adc.write(0x0800, 1)?;
//! let block = adc.read_block(0x0D00, 300)?;
//! println!("read {} words", block.transfer.transferred);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod backend;
pub mod error;
pub mod master;
pub mod settings;
pub mod simulated;
pub mod slave;
pub mod spec;

pub use backend::{BackendLimits, BlockOutcome, BusBackend, BusFault, IrqMask};
pub use error::{BusError, BusErrorKind, ConfigError, Result, VmeError};
pub use master::{BlockRead, BlockTransfer, BusMaster, MasterConfig, IRQ_LEVELS};
pub use settings::{Settings, Translator};
pub use simulated::{FaultScenario, SimulatedBackend};
pub use slave::{parse_address, BusSlave};
pub use spec::{AddressModifier, AddressingMode, DataWidth, ModeSet, ModifierKind, TransferMode};
