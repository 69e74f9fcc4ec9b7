//! Discriminator board driver.
//!
//! # Settings
//!
//! | Key | Values | Default |
//! |-----|--------|---------|
//! | `model` | `V895`, `V812` | required |
//! | `address` | hex or decimal literal | required |
//! | `threshold.CH00`..`threshold.CH15` | -255..-1 mV | channel inhibited |
//! | `width` | 0..255 | required |
//! | `deadtime` | 150..2000 ns, V812 only | unchanged |
//! | `coincidence` | 1..16 | 1 |

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, trace};
use vme_core::{
    AddressingMode, BusMaster, BusSlave, ConfigError, ModeSet, Result, Settings, TransferMode,
};

use super::spec::{
    channel_mask, deadtime_code, majority_code, registers, validate_modes, DiscriminatorModel,
    DISCRIMINATOR_MODELS, MAX_DEADTIME, MAX_INTERNAL_MAJORITY_THRESHOLD, MAX_OUTPUT_WIDTH,
    MAX_THRESHOLD, MIN_DEADTIME, MIN_OUTPUT_WIDTH, MIN_THRESHOLD, N_CHANNELS,
};

/// Settings key of the output width.
pub const OUTPUT_WIDTH_KEY: &str = "width";
/// Settings key of the V812 dead time.
pub const DEADTIME_KEY: &str = "deadtime";
/// Settings key of the majority threshold.
pub const MAJORITY_KEY: &str = "coincidence";

/// Settings key of the threshold of `channel`.
pub fn threshold_key(channel: usize) -> String {
    format!("threshold.CH{channel:02}")
}

/// Register values derived from the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscriminatorSetup {
    /// Threshold magnitude per channel; `None` leaves the channel inhibited.
    pub thresholds: [Option<u16>; N_CHANNELS],
    /// Output width code.
    pub output_width: u16,
    /// Dead time code (V812).
    pub deadtime: Option<u16>,
    /// Required coincidences.
    pub majority: u32,
}

impl DiscriminatorSetup {
    /// Resolve and validate the settings of a `model` board.
    pub fn from_settings(
        model: DiscriminatorModel,
        settings: &mut Settings,
    ) -> std::result::Result<Self, ConfigError> {
        let mut thresholds = [None; N_CHANNELS];
        for (channel, slot) in thresholds.iter_mut().enumerate() {
            let key = threshold_key(channel);
            if let Some(threshold) = settings.get_optional::<f64>(&key)? {
                // thresholds are negative
                if !(MAX_THRESHOLD..=MIN_THRESHOLD).contains(&threshold) {
                    return Err(settings.value_error(&key, threshold));
                }
                *slot = Some(threshold.abs() as u16);
            }
        }

        let output_width: i64 = settings.get(OUTPUT_WIDTH_KEY)?;
        if !(MIN_OUTPUT_WIDTH..=MAX_OUTPUT_WIDTH).contains(&output_width) {
            return Err(settings.value_error(OUTPUT_WIDTH_KEY, output_width));
        }

        let deadtime = match settings.get_optional::<f64>(DEADTIME_KEY)? {
            Some(deadtime)
                if model.has_deadtime() && (MIN_DEADTIME..=MAX_DEADTIME).contains(&deadtime) =>
            {
                Some(deadtime_code(deadtime))
            }
            Some(deadtime) => return Err(settings.value_error(DEADTIME_KEY, deadtime)),
            None => None,
        };

        let majority: i64 = settings.get_or(MAJORITY_KEY, 1)?;
        if !(1..=i64::from(MAX_INTERNAL_MAJORITY_THRESHOLD)).contains(&majority) {
            return Err(settings.value_error(MAJORITY_KEY, majority));
        }

        Ok(Self {
            thresholds,
            output_width: output_width as u16,
            deadtime,
            majority: majority as u32,
        })
    }

    /// PATTERN_INHIBIT value: one bit per configured channel.
    pub fn inhibit_pattern(&self) -> u16 {
        self.thresholds
            .iter()
            .enumerate()
            .filter(|(_, threshold)| threshold.is_some())
            .fold(0, |pattern, (channel, _)| pattern | channel_mask(channel))
    }
}

/// Identification words of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Fixed code word.
    pub fixed_code: u16,
    /// Manufacturer number.
    pub manufacturer: u16,
    /// Module type code.
    pub module_type: u16,
    /// Hardware version.
    pub version: u16,
    /// Serial number.
    pub serial: u16,
}

impl ModuleInfo {
    fn decode(fixed_code: u64, module_type: u64, version_serial: u64) -> Self {
        Self {
            fixed_code: fixed_code as u16,
            manufacturer: ((module_type >> 10) & 0x3F) as u16,
            module_type: (module_type & 0x3FF) as u16,
            version: ((version_serial >> 12) & 0xF) as u16,
            serial: (version_serial & 0xFFF) as u16,
        }
    }
}

/// CAEN V895/V812 16 channel discriminator.
#[derive(Debug)]
pub struct Discriminator {
    slave: BusSlave,
    model: DiscriminatorModel,
    setup: DiscriminatorSetup,
    settings: Settings,
}

impl Discriminator {
    /// Configure the board named `identifier` in A32/D16.
    pub fn new(identifier: &str, root: &Value, master: Arc<BusMaster>) -> Result<Self> {
        let modes = ModeSet::uniform(AddressingMode::A32, TransferMode::D16)?;
        Self::with_modes(identifier, root, master, modes)
    }

    /// Configure the board using `modes` (A24/D16 or A32/D16).
    pub fn with_modes(
        identifier: &str,
        root: &Value,
        master: Arc<BusMaster>,
        modes: ModeSet,
    ) -> Result<Self> {
        validate_modes(identifier, modes)?;
        let mut settings = Settings::load(root, identifier)?;
        let model = settings.translate("model", &DISCRIMINATOR_MODELS)?;
        let setup = DiscriminatorSetup::from_settings(model, &mut settings)?;
        let slave = BusSlave::from_settings(identifier, &settings, master, modes)?;
        let board = Self {
            slave,
            model,
            setup,
            settings,
        };
        board.init()?;
        Ok(board)
    }

    fn init(&self) -> Result<()> {
        let _entered = self.slave.span().enter();

        trace!("Setting the trigger thresholds");
        for (channel, threshold) in self.setup.thresholds.iter().enumerate() {
            if let Some(threshold) = threshold {
                trace!(channel, threshold_mv = -i32::from(*threshold), "Threshold");
                self.slave
                    .write(registers::THRESHOLD[channel], u64::from(*threshold))?;
            }
        }
        let inhibit = self.setup.inhibit_pattern();
        trace!(pattern = inhibit, "Setting the trigger inhibit mask");
        self.slave
            .write(registers::PATTERN_INHIBIT, u64::from(inhibit))?;

        trace!(width = self.setup.output_width, "Setting the trigger window");
        let width = u64::from(self.setup.output_width);
        self.slave.write(registers::OUTPUT_WIDTH_0_7, width)?;
        self.slave.write(registers::OUTPUT_WIDTH_8_15, width)?;

        if let Some(deadtime) = self.setup.deadtime {
            trace!(deadtime, "Setting the dead time");
            self.slave
                .write(registers::DEADTIME_0_7, u64::from(deadtime))?;
            self.slave
                .write(registers::DEADTIME_8_15, u64::from(deadtime))?;
        }

        let majority = majority_code(self.setup.majority);
        trace!(coincidence = self.setup.majority, code = majority, "Setting the majority threshold");
        self.slave
            .write(registers::MAJORITY_THRESHOLD, u64::from(majority))?;

        info!(model = %self.model, channels = inhibit.count_ones(), "Discriminator ready");
        Ok(())
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.slave.name()
    }

    /// Board variant.
    pub fn model(&self) -> DiscriminatorModel {
        self.model
    }

    /// Register values written at construction.
    pub fn setup(&self) -> &DiscriminatorSetup {
        &self.setup
    }

    /// Fire the test pulse on all channels.
    pub fn send_test_pulse(&self) -> Result<()> {
        self.slave.span().in_scope(|| debug!("Sending a test pulse to the board"));
        self.slave.write(registers::TEST_PULSE, 1)
    }

    /// Read the identification words.
    pub fn module_info(&self) -> Result<ModuleInfo> {
        let fixed_code = self.slave.read(registers::FIXED_CODE)?;
        let module_type = self.slave.read(registers::MODULE_TYPE)?;
        let version_serial = self.slave.read(registers::VERSION_SERIAL)?;
        Ok(ModuleInfo::decode(fixed_code, module_type, version_serial))
    }

    /// Write this board's settings and used defaults into `root`.
    pub fn save_settings(&self, root: &mut Value) {
        self.settings.save(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup(tree: &Value) -> std::result::Result<DiscriminatorSetup, ConfigError> {
        let mut settings = Settings::load(tree, "disc")?;
        let model = settings.translate("model", &DISCRIMINATOR_MODELS)?;
        DiscriminatorSetup::from_settings(model, &mut settings)
    }

    #[test]
    fn test_threshold_keys() {
        assert_eq!(threshold_key(3), "threshold.CH03");
        assert_eq!(threshold_key(12), "threshold.CH12");
    }

    #[test]
    fn test_inhibit_follows_thresholds() {
        let tree = json!({
            "disc": {
                "model": "V895",
                "width": 20,
                "threshold": { "CH00": -30, "CH05": "-12.5" }
            }
        });
        let setup = setup(&tree).unwrap();
        assert_eq!(setup.thresholds[0], Some(30));
        assert_eq!(setup.thresholds[5], Some(12));
        assert_eq!(setup.inhibit_pattern(), 0x21);
        assert_eq!(setup.majority, 1);
    }

    #[test]
    fn test_positive_threshold_rejected() {
        let tree = json!({ "disc": { "model": "V895", "width": 20, "threshold": { "CH01": 10 } } });
        let err = setup(&tree).unwrap_err();
        assert_eq!(err.key(), Some("threshold.CH01"));
        assert_eq!(err.kind(), "configuration_value_error");
    }

    #[test]
    fn test_width_and_majority_ranges() {
        let tree = json!({ "disc": { "model": "V895", "width": 256 } });
        assert_eq!(setup(&tree).unwrap_err().key(), Some(OUTPUT_WIDTH_KEY));

        let tree = json!({ "disc": { "model": "V895", "width": 0, "coincidence": 17 } });
        assert_eq!(setup(&tree).unwrap_err().key(), Some(MAJORITY_KEY));

        let tree = json!({ "disc": { "model": "V895", "width": 0, "coincidence": 0 } });
        assert!(setup(&tree).is_err());
    }

    #[test]
    fn test_deadtime_only_on_v812() {
        let tree = json!({ "disc": { "model": "V812", "width": 10, "deadtime": 2000 } });
        assert_eq!(setup(&tree).unwrap().deadtime, Some(255));

        let tree = json!({ "disc": { "model": "V812", "width": 10, "deadtime": 100 } });
        assert_eq!(setup(&tree).unwrap_err().key(), Some(DEADTIME_KEY));

        let tree = json!({ "disc": { "model": "V895", "width": 10, "deadtime": 500 } });
        assert_eq!(setup(&tree).unwrap_err().key(), Some(DEADTIME_KEY));
    }

    #[test]
    fn test_module_info_decode() {
        let info = ModuleInfo::decode(0xFAF5, (0x02 << 10) | 0x54, 0x3123);
        assert_eq!(info.fixed_code, 0xFAF5);
        assert_eq!(info.manufacturer, 2);
        assert_eq!(info.module_type, 0x54);
        assert_eq!(info.version, 3);
        assert_eq!(info.serial, 0x123);
    }
}
