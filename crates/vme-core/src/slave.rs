//! VME slave device handle.
//!
//! A [`BusSlave`] translates device-relative offsets into bus addresses and
//! forwards every transfer to its shared [`BusMaster`]. It has no bus logic of
//! its own.

use std::sync::Arc;

use tracing::{info, info_span, Span};

use crate::error::{ConfigError, Result, VmeError};
use crate::master::{BlockRead, BlockTransfer, BusMaster};
use crate::settings::Settings;
use crate::spec::ModeSet;

/// Parse a base address literal: `0x`-prefixed hexadecimal or decimal.
pub fn parse_address(literal: &str) -> Option<u64> {
    let literal = literal.trim();
    match literal
        .strip_prefix("0x")
        .or_else(|| literal.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => literal.parse().ok(),
    }
}

/// Device at a fixed base address on a shared bus.
#[derive(Debug, Clone)]
pub struct BusSlave {
    name: String,
    master: Arc<BusMaster>,
    base: u64,
    modes: ModeSet,
    span: Span,
}

impl BusSlave {
    /// Bind a device named `name` at `base` to `master`.
    pub fn new(
        name: impl Into<String>,
        master: Arc<BusMaster>,
        base: u64,
        modes: ModeSet,
    ) -> Result<Self> {
        let name = name.into();
        if !modes.addressing().contains(base) {
            return Err(VmeError::AddressOutOfRange {
                device: name,
                addressing: modes.addressing(),
                address: base,
            });
        }
        let span = info_span!(
            parent: master.span(),
            "vme_slave",
            device = %name,
            base = format_args!("0x{base:08X}")
        );
        span.in_scope(|| {
            info!(
                addressing = %modes.addressing(),
                single = %modes.single(),
                block = %modes.block(),
                "Attached VME slave"
            )
        });
        Ok(Self {
            name,
            master,
            base,
            modes,
            span,
        })
    }

    /// Bind using the `address` key of `settings`.
    ///
    /// The address may be a number or a hex/decimal literal string.
    pub fn from_settings(
        name: impl Into<String>,
        settings: &Settings,
        master: Arc<BusMaster>,
        modes: ModeSet,
    ) -> Result<Self> {
        let base = read_address(settings, "address")?;
        Self::new(name, master, base, modes)
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Addressing and transfer modes of this device.
    pub fn modes(&self) -> ModeSet {
        self.modes
    }

    /// Shared bus master.
    pub fn master(&self) -> &Arc<BusMaster> {
        &self.master
    }

    /// Tracing span of this device.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Single read at `offset`.
    pub fn read(&self, offset: u64) -> Result<u64> {
        let address = self.address(offset)?;
        self.master
            .read_single(self.modes.addressing(), self.modes.single(), address)
    }

    /// Single write of `value` at `offset`.
    pub fn write(&self, offset: u64, value: u64) -> Result<()> {
        let address = self.address(offset)?;
        self.master
            .write_single(self.modes.addressing(), self.modes.single(), address, value)
    }

    /// Block read of `count` elements at `offset`.
    pub fn read_block(&self, offset: u64, count: usize) -> Result<BlockRead> {
        let address = self.address(offset)?;
        self.master
            .read_block(self.modes.addressing(), self.modes.block(), address, count)
    }

    /// Block read into `buf` at `offset`.
    pub fn read_block_into(&self, offset: u64, buf: &mut [u64]) -> Result<BlockTransfer> {
        let address = self.address(offset)?;
        self.master
            .read_block_into(self.modes.addressing(), self.modes.block(), address, buf)
    }

    /// Block write of `data` at `offset`.
    pub fn write_block(&self, offset: u64, data: &[u64]) -> Result<BlockTransfer> {
        let address = self.address(offset)?;
        self.master
            .write_block(self.modes.addressing(), self.modes.block(), address, data)
    }

    fn address(&self, offset: u64) -> Result<u64> {
        self.base
            .checked_add(offset)
            .ok_or_else(|| VmeError::AddressOutOfRange {
                device: self.name.clone(),
                addressing: self.modes.addressing(),
                address: self.base,
            })
    }
}

/// Read an address literal from `key`.
pub fn read_address(settings: &Settings, key: &str) -> std::result::Result<u64, ConfigError> {
    let raw: serde_json::Value = settings.get(key)?;
    let parsed = match &raw {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => parse_address(s),
        _ => None,
    };
    parsed.ok_or_else(|| settings.value_error(key, raw))
}
