//! V895/V812 discriminator properties and register map.

use std::fmt;

use vme_core::{AddressingMode, ModeSet, Result, TransferMode, Translator, VmeError};

/// Number of input channels.
pub const N_CHANNELS: usize = 16;
/// Largest internal majority threshold (coincidences on this board).
pub const MAX_INTERNAL_MAJORITY_THRESHOLD: u32 = 16;
/// Threshold closest to zero, in mV.
pub const MIN_THRESHOLD: f64 = -1.0;
/// Most negative threshold, in mV.
pub const MAX_THRESHOLD: f64 = -255.0;
/// Narrowest output width code.
pub const MIN_OUTPUT_WIDTH: i64 = 0;
/// Widest output width code. The width itself grows non-linearly with the code.
pub const MAX_OUTPUT_WIDTH: i64 = 255;
/// Shortest V812 dead time in ns.
pub const MIN_DEADTIME: f64 = 150.0;
/// Longest V812 dead time in ns.
pub const MAX_DEADTIME: f64 = 2000.0;

/// Discriminator variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscriminatorModel {
    /// Leading edge discriminator.
    V895,
    /// Constant fraction discriminator with programmable dead time.
    V812,
}

/// Model names accepted in the `model` key.
pub const DISCRIMINATOR_MODELS: Translator<DiscriminatorModel> = Translator::new(&[
    ("V895", DiscriminatorModel::V895),
    ("V812", DiscriminatorModel::V812),
]);

impl DiscriminatorModel {
    /// Whether the dead time registers exist.
    pub const fn has_deadtime(self) -> bool {
        matches!(self, DiscriminatorModel::V812)
    }
}

impl fmt::Display for DiscriminatorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscriminatorModel::V895 => write!(f, "V895"),
            DiscriminatorModel::V812 => write!(f, "V812"),
        }
    }
}

/// Register offsets relative to the board base address.
pub mod registers {
    /// Per-channel threshold, write only.
    pub const THRESHOLD: [u64; super::N_CHANNELS] = [
        0x00, 0x02, 0x04, 0x06, 0x08, 0x0A, 0x0C, 0x0E, 0x10, 0x12, 0x14, 0x16, 0x18, 0x1A, 0x1C,
        0x1E,
    ];
    /// Output width of channels 0..7.
    pub const OUTPUT_WIDTH_0_7: u64 = 0x40;
    /// Output width of channels 8..15.
    pub const OUTPUT_WIDTH_8_15: u64 = 0x42;
    /// Dead time of channels 0..7 (V812).
    pub const DEADTIME_0_7: u64 = 0x44;
    /// Dead time of channels 8..15 (V812).
    pub const DEADTIME_8_15: u64 = 0x46;
    /// Majority threshold.
    pub const MAJORITY_THRESHOLD: u64 = 0x48;
    /// Enabled channel pattern.
    pub const PATTERN_INHIBIT: u64 = 0x4A;
    /// Test pulse strobe.
    pub const TEST_PULSE: u64 = 0x4C;
    /// Fixed identification code, read only.
    pub const FIXED_CODE: u64 = 0xFA;
    /// Manufacturer and module type, read only.
    pub const MODULE_TYPE: u64 = 0xFC;
    /// Version and serial number, read only.
    pub const VERSION_SERIAL: u64 = 0xFE;
}

/// Inhibit pattern bit of `channel`.
pub const fn channel_mask(channel: usize) -> u16 {
    1 << channel
}

/// Check that the board supports `modes`: A24 or A32 with D16 transfers.
pub fn validate_modes(name: &str, modes: ModeSet) -> Result<()> {
    let addressing_ok = matches!(
        modes.addressing(),
        AddressingMode::A24 | AddressingMode::A32
    );
    if addressing_ok && modes.single() == TransferMode::D16 {
        Ok(())
    } else {
        Err(VmeError::protocol(
            name,
            format!(
                "Invalid mode {}/{} for discriminator board, only A24/D16 and A32/D16 supported",
                modes.addressing(),
                modes.single()
            ),
        ))
    }
}

/// Majority register code for `n` coincidences.
///
/// Rounds to nearest as the manual's NINT does, so 2 gives 19 rather than the
/// 18 an integer division would truncate to.
pub fn majority_code(n: u32) -> u16 {
    ((f64::from(n) * 50.0 - 25.0) / 4.0).round() as u16
}

/// Dead time register code for `deadtime_ns`, linear over the V812 range.
pub fn deadtime_code(deadtime_ns: f64) -> u16 {
    ((deadtime_ns - MIN_DEADTIME) / (MAX_DEADTIME - MIN_DEADTIME) * 255.0).round() as u16
}
