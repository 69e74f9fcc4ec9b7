//! V1729/V1729A geometry, register map and settings tables.
//!
//! Memory layout: a 12 word header followed by a 10240 word circular data
//! region of 16 bit words, only 12 (V1729) or 14 (V1729A) bits of which are
//! significant. Four channels are interleaved row by row in descending
//! channel order; verniers live in header words 4..8.

use std::fmt;

use vme_core::Translator;

/// Number of analog channels.
pub const N_CHANNELS: usize = 4;
/// Number of columns (cells) of the analog memory.
pub const N_CELLS: usize = 128;
/// Rows per column.
pub const ROWS_PER_CELL: usize = 20;
/// Rows in the circular data region.
pub const N_ROWS: usize = N_CELLS * ROWS_PER_CELL;
/// Header words preceding the data region.
pub const MEMORY_HEADER_SIZE: usize = 12;
/// Words in the data region.
pub const MEMORY_DATA_SIZE: usize = N_CHANNELS * N_ROWS;
/// Words in one full memory read.
pub const MEMORY_SIZE: usize = MEMORY_HEADER_SIZE + MEMORY_DATA_SIZE;
/// Leading data words that cannot be trusted after a trigger.
pub const MEMORY_DATA_SKIP: usize = 40;
/// Leading data rows skipped per channel.
pub const SKIP_ROWS: usize = MEMORY_DATA_SKIP / N_CHANNELS;
/// Samples available per channel.
pub const SAMPLES_PER_CHANNEL: usize = (MEMORY_DATA_SIZE - MEMORY_DATA_SKIP) / N_CHANNELS;
/// First header word holding a vernier.
pub const MEMORY_VERNIER_INDEX: usize = 4;
/// Words produced by the vernier calibration acquisition.
pub const VERNIER_MEMORY_SIZE: usize = 16 * 1024;
/// Post-trigger the board always adds to the programmed value.
pub const INTRINSIC_POSTTRIG: u16 = 7;
/// Smallest PRETRIG at 2 GHz sampling.
pub const MIN_PRETRIG_2GHZ: u16 = 10_000;
/// Smallest PRETRIG at 1 GHz sampling.
pub const MIN_PRETRIG_1GHZ: u16 = 5_000;
/// Largest trigger threshold magnitude in mV.
pub const MAX_ABS_TRIGGER_THRESHOLD: f64 = 1000.0;

/// Board variant, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Submodel {
    /// 12 bit board.
    V1729,
    /// 14 bit board.
    V1729A,
}

/// Model names accepted in the `model` key.
pub const SUBMODELS: Translator<Submodel> =
    Translator::new(&[("V1729", Submodel::V1729), ("V1729A", Submodel::V1729A)]);

impl Submodel {
    /// Significant bits per memory word.
    pub const fn precision(self) -> u32 {
        match self {
            Submodel::V1729 => 12,
            Submodel::V1729A => 14,
        }
    }

    /// Mask applied to raw memory words.
    pub const fn memory_mask(self) -> u16 {
        0xFFFF >> (16 - self.precision())
    }

    /// BIT_MODE flag of the mode register.
    pub const fn bit_mode(self) -> u64 {
        match self {
            Submodel::V1729 => 0x0,
            Submodel::V1729A => 0x2,
        }
    }
}

impl fmt::Display for Submodel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Submodel::V1729 => write!(f, "V1729"),
            Submodel::V1729A => write!(f, "V1729A"),
        }
    }
}

/// Register split over a low and a high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRegister {
    /// Low byte.
    pub lsb: u64,
    /// High byte.
    pub msb: u64,
}

/// Register offsets relative to the board base address.
#[allow(missing_docs)]
pub mod registers {
    use super::SplitRegister;

    pub const INTERRUPT: u64 = 0x0000;
    pub const FP_FREQUENCY: u64 = 0x0100;
    pub const FPGA_VERSION: u64 = 0x0200;
    pub const MODE_REGISTER: u64 = 0x0300;
    pub const FPGA_EVOLUTION: u64 = 0x0400;
    pub const RESET: u64 = 0x0800;
    pub const LOAD_TRIGGER_THRESHOLD_DAC: u64 = 0x0900;
    pub const TRIGGER_THRESHOLD_DAC: u64 = 0x0A00;
    pub const RAM_DATA: u64 = 0x0D00;
    pub const RAM_INT_ADD: SplitRegister = SplitRegister { lsb: 0x0E00, msb: 0x0F00 };
    pub const MAT_CTRL_REGISTER: SplitRegister = SplitRegister { lsb: 0x1000, msb: 0x1100 };
    pub const START_ACQUISITION: u64 = 0x1700;
    pub const PRETRIG: SplitRegister = SplitRegister { lsb: 0x1800, msb: 0x1900 };
    pub const POSTTRIG: SplitRegister = SplitRegister { lsb: 0x1A00, msb: 0x1B00 };
    pub const SOFTWARE_TRIGGER: u64 = 0x1C00;
    pub const TRIGGER_TYPE: u64 = 0x1D00;
    pub const TRIGGER_CHANNEL_SOURCE: u64 = 0x1E00;
    pub const TRIG_REC: u64 = 0x2000;
    pub const FAST_READ_MODES: u64 = 0x2100;
    pub const NB_OF_COLS_TO_READ: u64 = 0x2200;
    pub const CHANNEL_MASK: u64 = 0x2300;
    pub const VALP_CP_REGISTER: u64 = 0x2600;
    pub const VALI_CP_REGISTER: u64 = 0x2700;
    pub const TRIGGER_THRESHOLD_DAC_CH: [u64; 4] = [0x2800, 0x2900, 0x2A00, 0x2B00];
    pub const EEPROM_WRITE: u64 = 0x2C00;
    pub const EEPROM_POLL: u64 = 0x2D00;
    pub const EEPROM_READ: u64 = 0x2E00;
    pub const POST_STOP_LATENCY: u64 = 0x3000;
    pub const POST_LATENCY_PRETRIG: u64 = 0x3100;
    pub const NUMBER_OF_CHANNELS: u64 = 0x3400;
    pub const RATE_REG: u64 = 0x3800;
    pub const TRIG_COUNT: SplitRegister = SplitRegister { lsb: 0x3900, msb: 0x3A00 };
    pub const TRIG_RATE: SplitRegister = SplitRegister { lsb: 0x3B00, msb: 0x3C00 };
    pub const TRIG_COUNT_RATE_BLOCK: u64 = 0x3D00;
}

/// Mode register bits.
pub mod mode {
    /// VME IRQ on end of acquisition.
    pub const ENABLE_IRQ: u64 = 0x1;
    /// Restart acquisition when TRIG_REC is read.
    pub const AUTO_RESTART_SHIFT: u32 = 2;
}

/// TRIGGER_TYPE source field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerType {
    /// Software trigger.
    Software = 0x0,
    /// Internal discriminator on the DAC threshold.
    Internal = 0x1,
    /// External trigger input.
    External = 0x2,
    /// Software or internal.
    Or = 0x3,
}

impl From<TriggerType> for u32 {
    fn from(value: TriggerType) -> Self {
        value as u32
    }
}

/// Values of `triggerType`.
pub const TRIGGER_TYPES: Translator<TriggerType> = Translator::new(&[
    ("software", TriggerType::Software),
    ("internal", TriggerType::Internal),
    ("external", TriggerType::External),
    ("or", TriggerType::Or),
]);

/// TRIGGER_TYPE option bits combined with the source.
#[allow(missing_docs)]
pub mod trigger_settings {
    pub const RISING_EDGE: u8 = 0x00;
    pub const FALLING_EDGE: u8 = 0x04;
    pub const RANDOM: u8 = 0x08;
    pub const DIRECT_EXTERNAL: u8 = 0x10;
    pub const EN_EXT_TRIG: u8 = 0x40;
}

/// Values of `triggerSettings`.
pub const TRIGGER_SETTINGS: Translator<u8> = Translator::new(&[
    ("rising", trigger_settings::RISING_EDGE),
    ("falling", trigger_settings::FALLING_EDGE),
    ("random", trigger_settings::RANDOM),
    ("directExternal", trigger_settings::DIRECT_EXTERNAL),
    ("enExtTrig", trigger_settings::EN_EXT_TRIG),
]);

/// Channel bits used by masks and trigger sources.
#[allow(missing_docs)]
pub mod channel {
    pub const C0: u8 = 0x1;
    pub const C1: u8 = 0x2;
    pub const C2: u8 = 0x4;
    pub const C3: u8 = 0x8;
    pub const ALL: u8 = 0xF;
}

/// Values of `channelMask` and `triggerChannelSource`.
pub const CHANNELS: Translator<u8> = Translator::new(&[
    ("CH0", channel::C0),
    ("CH1", channel::C1),
    ("CH2", channel::C2),
    ("CH3", channel::C3),
    ("ALL", channel::ALL),
]);

/// Sampling frequency as divider of 2 GHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingFrequency {
    /// 2 GHz.
    Fs2GHz = 0x1,
    /// 1 GHz.
    Fs1GHz = 0x2,
}

impl SamplingFrequency {
    /// Smallest PRETRIG allowed at this frequency.
    pub const fn min_pretrig(self) -> u16 {
        match self {
            SamplingFrequency::Fs2GHz => MIN_PRETRIG_2GHZ,
            SamplingFrequency::Fs1GHz => MIN_PRETRIG_1GHZ,
        }
    }
}

/// Values of `samplingFrequency`.
pub const SAMPLING_FREQUENCIES: Translator<SamplingFrequency> = Translator::new(&[
    ("2GHz", SamplingFrequency::Fs2GHz),
    ("1GHz", SamplingFrequency::Fs1GHz),
]);

/// Values of `channelMultiplexing` (memory channels per input).
pub const CHANNEL_MULTIPLEXING: Translator<u8> =
    Translator::new(&[("single", 4), ("duplex", 2), ("quadruplex", 1)]);

/// Values of boolean flags.
pub const BINARY: Translator<u8> = Translator::new(&[("false", 0), ("true", 1)]);

/// Convert a threshold in mV into the 12 bit DAC code (-1 V..1 V onto 0..0xFFF).
pub fn threshold_dac(threshold_mv: f64) -> u64 {
    ((threshold_mv + MAX_ABS_TRIGGER_THRESHOLD) / (2.0 * MAX_ABS_TRIGGER_THRESHOLD) * 4095.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(MEMORY_DATA_SIZE, 10_240);
        assert_eq!(MEMORY_SIZE, 10_252);
        assert_eq!(SAMPLES_PER_CHANNEL, 2_550);
        assert_eq!(SKIP_ROWS, 10);
    }

    #[test]
    fn test_submodel_masks() {
        assert_eq!(Submodel::V1729.memory_mask(), 0x0FFF);
        assert_eq!(Submodel::V1729A.memory_mask(), 0x3FFF);
        assert_eq!(Submodel::V1729A.bit_mode(), 0x2);
    }

    #[test]
    fn test_threshold_dac() {
        assert_eq!(threshold_dac(-1000.0), 0);
        assert_eq!(threshold_dac(1000.0), 0xFFF);
        assert_eq!(threshold_dac(0.0), 2047);
    }
}
