//! V1729/V1729A board driver.
//!
//! # Settings
//!
//! | Key | Values | Default |
//! |-----|--------|---------|
//! | `model` | `V1729`, `V1729A` | required |
//! | `address` | hex or decimal literal | required |
//! | `triggerType` | `software`, `internal`, `external`, `or` | required |
//! | `triggerSettings` | list of `rising`, `falling`, `random`, `directExternal`, `enExtTrig` | required |
//! | `triggerThreshold` | -1000..1000 mV | required unless external and direct |
//! | `preTrig` | >= 10000 (2 GHz) or 5000 (1 GHz) | required |
//! | `postTrig` | >= 7 | required |
//! | `samplingFrequency` | `2GHz`, `1GHz` | required |
//! | `enableIRQ` | `true`, `false` | `true` |
//! | `autoRestartAcq` | `true`, `false` | `true` |
//! | `triggerChannelSource` | list of `CH0`..`CH3`, `ALL` | `[ALL]` |
//! | `channelMask` | list of `CH0`..`CH3`, `ALL` | `[ALL]` |
//! | `channelMultiplexing` | `single`, `duplex`, `quadruplex` | `single` |

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, trace, warn};
use vme_core::{
    AddressingMode, BlockRead, BusMaster, BusSlave, ConfigError, ModeSet, Result, Settings,
    TransferMode, VmeError,
};

use super::buffer::{unpack_words, DigitizerBuffer};
use super::calibration::DigitizerCalibration;
use super::spec::{
    mode, registers, threshold_dac, trigger_settings, SamplingFrequency, SplitRegister, Submodel,
    TriggerType, BINARY, CHANNELS, CHANNEL_MULTIPLEXING, INTRINSIC_POSTTRIG,
    MAX_ABS_TRIGGER_THRESHOLD, MEMORY_SIZE, N_CELLS, N_CHANNELS, SAMPLING_FREQUENCIES, SUBMODELS,
    TRIGGER_SETTINGS, TRIGGER_TYPES, VERNIER_MEMORY_SIZE,
};

/// Settings keys.
pub mod keys {
    /// Trigger source.
    pub const TRIGGER_TYPE: &str = "triggerType";
    /// Trigger option list.
    pub const TRIGGER_SETTINGS: &str = "triggerSettings";
    /// Trigger threshold in mV.
    pub const TRIGGER_THRESHOLD: &str = "triggerThreshold";
    /// Pre-trigger length.
    pub const PRETRIG: &str = "preTrig";
    /// Post-trigger length.
    pub const POSTTRIG: &str = "postTrig";
    /// Sampling frequency.
    pub const SAMPLING_FREQUENCY: &str = "samplingFrequency";
    /// IRQ on end of acquisition.
    pub const ENABLE_IRQ: &str = "enableIRQ";
    /// Restart acquisition on TRIG_REC read.
    pub const AUTO_RESTART_ACQ: &str = "autoRestartAcq";
    /// Channels feeding the internal trigger.
    pub const TRIGGER_CHANNEL_SOURCE: &str = "triggerChannelSource";
    /// Channels read out.
    pub const CHANNEL_MASK: &str = "channelMask";
    /// Memory channels per input.
    pub const CHANNEL_MULTIPLEXING: &str = "channelMultiplexing";
}

/// Register level configuration derived from the settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitizerSetup {
    /// Trigger source.
    pub trigger_type: TriggerType,
    /// TRIGGER_TYPE register value (source and options).
    pub trigger_pattern: u32,
    /// DAC threshold in mV, absent for direct external triggering.
    pub trigger_threshold: Option<f64>,
    /// Trigger channel pattern for internal and "or" triggering.
    pub trigger_channel_source: Option<u32>,
    /// Pre-trigger length.
    pub pretrig: u16,
    /// Post-trigger length including the intrinsic part.
    pub posttrig: u16,
    /// Sampling frequency.
    pub sampling_frequency: SamplingFrequency,
    /// IRQ on end of acquisition.
    pub enable_irq: bool,
    /// Restart acquisition on TRIG_REC read.
    pub auto_restart: bool,
    /// Channels read out.
    pub channel_mask: u32,
    /// Memory channels per input.
    pub channel_multiplexing: u8,
}

impl DigitizerSetup {
    /// Resolve and validate the digitizer settings.
    pub fn from_settings(settings: &mut Settings) -> std::result::Result<Self, ConfigError> {
        let trigger_type = settings.translate(keys::TRIGGER_TYPE, &TRIGGER_TYPES)?;
        let trigger_pattern =
            settings.bitpattern(keys::TRIGGER_SETTINGS, &TRIGGER_SETTINGS)? | u32::from(trigger_type);

        let trigger_channel_source = match trigger_type {
            TriggerType::Internal | TriggerType::Or => {
                Some(settings.bitpattern_or(keys::TRIGGER_CHANNEL_SOURCE, &["ALL"], &CHANNELS)?)
            }
            TriggerType::Software | TriggerType::External => None,
        };

        let direct_external = trigger_type == TriggerType::External
            && trigger_pattern & u32::from(trigger_settings::DIRECT_EXTERNAL) != 0;
        let trigger_threshold = if direct_external {
            None
        } else {
            let threshold: f64 = settings.get(keys::TRIGGER_THRESHOLD)?;
            if !(threshold.abs() <= MAX_ABS_TRIGGER_THRESHOLD) {
                return Err(settings.value_error(keys::TRIGGER_THRESHOLD, threshold));
            }
            Some(threshold)
        };

        let sampling_frequency = settings.translate(keys::SAMPLING_FREQUENCY, &SAMPLING_FREQUENCIES)?;
        let pretrig: u16 = settings.get(keys::PRETRIG)?;
        if pretrig < sampling_frequency.min_pretrig() {
            return Err(settings.value_error(keys::PRETRIG, pretrig));
        }
        let posttrig: u16 = settings.get(keys::POSTTRIG)?;
        if posttrig < INTRINSIC_POSTTRIG {
            return Err(settings.value_error(keys::POSTTRIG, posttrig));
        }

        let enable_irq = settings.translate_or(keys::ENABLE_IRQ, "true", &BINARY)? != 0;
        let auto_restart = settings.translate_or(keys::AUTO_RESTART_ACQ, "true", &BINARY)? != 0;
        let channel_mask = settings.bitpattern_or(keys::CHANNEL_MASK, &["ALL"], &CHANNELS)?;
        let channel_multiplexing =
            settings.translate_or(keys::CHANNEL_MULTIPLEXING, "single", &CHANNEL_MULTIPLEXING)?;

        Ok(Self {
            trigger_type,
            trigger_pattern,
            trigger_threshold,
            trigger_channel_source,
            pretrig,
            posttrig,
            sampling_frequency,
            enable_irq,
            auto_restart,
            channel_mask,
            channel_multiplexing,
        })
    }

    /// MODE_REGISTER value for `submodel`.
    pub fn mode_register(&self, submodel: Submodel) -> u64 {
        let mut value = submodel.bit_mode();
        if self.enable_irq {
            value |= mode::ENABLE_IRQ;
        }
        if self.auto_restart {
            value |= 1 << mode::AUTO_RESTART_SHIFT;
        }
        value
    }
}

/// Board handle shared by the driver and the calibration procedures.
#[derive(Debug)]
struct Board {
    slave: BusSlave,
    submodel: Submodel,
    setup: DigitizerSetup,
    settings: Settings,
}

impl Board {
    fn open(identifier: &str, root: &Value, master: Arc<BusMaster>, modes: ModeSet) -> Result<Self> {
        let mut settings = Settings::load(root, identifier)?;
        let submodel = settings.translate("model", &SUBMODELS)?;
        let setup = DigitizerSetup::from_settings(&mut settings)?;
        let slave = BusSlave::from_settings(identifier, &settings, master, modes)?;
        let board = Self {
            slave,
            submodel,
            setup,
            settings,
        };
        board.init()?;
        Ok(board)
    }

    fn name(&self) -> &str {
        self.slave.name()
    }

    fn write(&self, register: u64, value: u64) -> Result<()> {
        self.slave.write(register, value)
    }

    fn write_split(&self, register: SplitRegister, value: u16) -> Result<()> {
        self.write(register.lsb, u64::from(value & 0xFF))?;
        self.write(register.msb, u64::from(value >> 8))
    }

    fn init(&self) -> Result<()> {
        let _entered = self.slave.span().enter();
        trace!("Reset board status");
        self.write(registers::RESET, 1)?;
        self.init_trigger()?;
        self.init_mode_register()?;
        self.init_digitizer()?;
        self.init_window()?;
        debug!(submodel = %self.submodel, "Board initialized");
        Ok(())
    }

    fn init_trigger(&self) -> Result<()> {
        trace!("Initializing trigger");
        self.write(registers::RATE_REG, 1)?;
        self.write(registers::TRIGGER_TYPE, u64::from(self.setup.trigger_pattern))?;
        if let Some(source) = self.setup.trigger_channel_source {
            self.write(registers::TRIGGER_CHANNEL_SOURCE, u64::from(source))?;
        }
        if let Some(threshold) = self.setup.trigger_threshold {
            self.write(registers::TRIGGER_THRESHOLD_DAC, threshold_dac(threshold))?;
            self.write(registers::LOAD_TRIGGER_THRESHOLD_DAC, 1)?;
        }
        Ok(())
    }

    fn init_mode_register(&self) -> Result<()> {
        trace!("Initializing mode register");
        self.write(registers::MODE_REGISTER, self.setup.mode_register(self.submodel))
    }

    fn init_digitizer(&self) -> Result<()> {
        trace!("Initializing digitizer");
        self.write(registers::FP_FREQUENCY, self.setup.sampling_frequency as u64)?;
        self.write(registers::NB_OF_COLS_TO_READ, N_CELLS as u64)?;
        self.write(registers::CHANNEL_MASK, u64::from(self.setup.channel_mask))?;
        self.write(
            registers::NUMBER_OF_CHANNELS,
            u64::from(self.setup.channel_multiplexing),
        )
    }

    fn init_window(&self) -> Result<()> {
        trace!("Initializing acquisition window");
        self.write_split(registers::PRETRIG, self.setup.pretrig)?;
        self.write_split(registers::POSTTRIG, self.setup.posttrig - INTRINSIC_POSTTRIG)
    }

    /// Random software trigger on all channels, reading `columns` columns.
    fn arm_random_trigger(&self, columns: usize) -> Result<()> {
        self.write(
            registers::TRIGGER_TYPE,
            u64::from(TriggerType::Software as u8 | trigger_settings::RANDOM),
        )?;
        self.write(registers::CHANNEL_MASK, u64::from(super::spec::channel::ALL))?;
        self.write(registers::NB_OF_COLS_TO_READ, columns as u64)
    }

    fn acquire_once(&self) -> Result<()> {
        self.write(registers::START_ACQUISITION, 1)?;
        self.slave.master().wait_for_irq()
    }

    /// Block read of `out.len()` memory words from RAM_DATA.
    fn read_memory(&self, out: &mut [u16]) -> Result<usize> {
        let word_bytes = self.slave.modes().block().width();
        if word_bytes < 2 {
            return Err(VmeError::protocol(
                self.name(),
                format!("{} cannot carry 16 bit memory words", self.slave.modes().block()),
            ));
        }
        let per_word = word_bytes / 2;
        let words = out.len().div_ceil(per_word);
        let BlockRead { values, transfer } = self.slave.read_block(registers::RAM_DATA, words)?;
        transfer.require_complete(self.name())?;
        Ok(unpack_words(&values, word_bytes, out))
    }

    fn end(&self) -> Result<()> {
        trace!(device = %self.name(), "Resetting board status");
        self.write(registers::RESET, 1)
    }
}

/// CAEN V1729/V1729A 4 channel 2 GHz digitizer.
#[derive(Debug)]
pub struct V1729 {
    board: Board,
    calibration: Arc<DigitizerCalibration>,
}

impl V1729 {
    /// Default modes: A32 with D32 single and MBLT block transfers.
    pub fn default_modes() -> Result<ModeSet> {
        ModeSet::new(AddressingMode::A32, TransferMode::D32, TransferMode::Mblt)
    }

    /// Configure the board named `identifier` in `root` with `calibration`.
    pub fn new(
        identifier: &str,
        root: &Value,
        master: Arc<BusMaster>,
        calibration: DigitizerCalibration,
    ) -> Result<Self> {
        Self::with_modes(identifier, root, master, calibration, Self::default_modes()?)
    }

    /// Configure the board using explicit transfer modes.
    pub fn with_modes(
        identifier: &str,
        root: &Value,
        master: Arc<BusMaster>,
        calibration: DigitizerCalibration,
        modes: ModeSet,
    ) -> Result<Self> {
        calibration.validate()?;
        let board = Board::open(identifier, root, master, modes)?;
        let calibration = Arc::new(calibration.with_post_trig(board.setup.posttrig));
        board.slave.span().in_scope(|| {
            info!(
                submodel = %board.submodel,
                trigger = ?board.setup.trigger_type,
                post_trig = board.setup.posttrig,
                "V1729 ready"
            )
        });
        Ok(Self { board, calibration })
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.board.name()
    }

    /// Board variant.
    pub fn submodel(&self) -> Submodel {
        self.board.submodel
    }

    /// Register level configuration.
    pub fn setup(&self) -> &DigitizerSetup {
        &self.board.setup
    }

    /// Calibration used to decode pulses.
    pub fn calibration(&self) -> &Arc<DigitizerCalibration> {
        &self.calibration
    }

    /// Underlying slave handle.
    pub fn slave(&self) -> &BusSlave {
        &self.board.slave
    }

    /// Empty buffer matching this board.
    pub fn new_buffer(&self) -> DigitizerBuffer {
        DigitizerBuffer::new(self.board.submodel)
    }

    /// Start an acquisition.
    pub fn start_acquisition(&self) -> Result<()> {
        self.board.write(registers::START_ACQUISITION, 1)
    }

    /// Force a trigger.
    pub fn software_trigger(&self) -> Result<()> {
        self.board.write(registers::SOFTWARE_TRIGGER, 1)
    }

    /// Read the acquired pulse into `buffer` and decode it.
    ///
    /// Reading TRIG_REC restarts the acquisition when `autoRestartAcq` is
    /// set. Returns the number of memory words read.
    pub fn read_pulse(&self, buffer: &mut DigitizerBuffer) -> Result<usize> {
        let _entered = self.board.slave.span().enter();
        let read = self.board.read_memory(buffer.raw_mut())?;
        let trig_rec = self.board.slave.read(registers::TRIG_REC)?;
        trace!(words = read, trig_rec, "Read pulse");
        buffer.calibrate(Arc::clone(&self.calibration), trig_rec as u16)?;
        Ok(read)
    }

    /// Wait for the end of acquisition IRQ, then [`read_pulse`](Self::read_pulse).
    pub fn wait_and_read(&self, buffer: &mut DigitizerBuffer) -> Result<usize> {
        self.board.slave.master().wait_for_irq()?;
        self.read_pulse(buffer)
    }

    /// Write this board's settings and used defaults into `root`.
    pub fn save_settings(&self, root: &mut Value) {
        self.board.settings.save(root);
    }

    // =========================================================================
    // Calibration procedures
    // =========================================================================

    /// Average `n_acquisitions` random-trigger acquisitions into a per-word
    /// pedestal.
    pub fn measure_pedestal(
        identifier: &str,
        root: &Value,
        master: Arc<BusMaster>,
        n_acquisitions: usize,
    ) -> Result<Vec<u16>> {
        let board = Board::open(identifier, root, master, Self::default_modes()?)?;
        let _entered = board.slave.span().enter();
        if n_acquisitions == 0 {
            return Err(VmeError::protocol(
                board.name(),
                "Pedestal measurement needs at least one acquisition",
            ));
        }
        info!(n_acquisitions, "Measuring the board pedestal");

        board.write(registers::RESET, 1)?;
        board.arm_random_trigger(N_CELLS)?;

        let mask = board.submodel.memory_mask();
        let weight = 1.0 / n_acquisitions as f64;
        let mut sum = vec![0.0f64; MEMORY_SIZE];
        let mut memory = vec![0u16; MEMORY_SIZE];
        for acquisition in 0..n_acquisitions {
            board.acquire_once()?;
            let read = board.read_memory(&mut memory)?;
            if read != MEMORY_SIZE {
                return Err(VmeError::protocol(
                    board.name(),
                    format!("Pedestal acquisition returned {read} of {MEMORY_SIZE} words"),
                ));
            }
            for (acc, &raw) in sum.iter_mut().zip(&memory) {
                *acc += f64::from(raw & mask) * weight;
            }
            trace!(acquisition, "Pedestal acquisition done");
        }
        board.end()?;
        debug!("Pedestal measurement complete");

        Ok(sum
            .into_iter()
            .map(|mean| mean.round().clamp(0.0, f64::from(u16::MAX)) as u16)
            .collect())
    }

    /// Record the vernier range of every channel from one random-trigger
    /// acquisition with zero columns read.
    pub fn calibrate_verniers(
        identifier: &str,
        root: &Value,
        master: Arc<BusMaster>,
    ) -> Result<([u16; N_CHANNELS], [u16; N_CHANNELS])> {
        let board = Board::open(identifier, root, master, Self::default_modes()?)?;
        let _entered = board.slave.span().enter();
        info!("Calibrating the verniers");

        board.arm_random_trigger(0)?;
        board.acquire_once()?;
        let mut memory = vec![0u16; VERNIER_MEMORY_SIZE];
        let read = board.read_memory(&mut memory)?;
        if read != VERNIER_MEMORY_SIZE {
            return Err(VmeError::protocol(
                board.name(),
                "Problem reading the vernier calibration data",
            ));
        }

        let mut min = [u16::MAX; N_CHANNELS];
        let mut max = [u16::MIN; N_CHANNELS];
        for (i, &value) in memory.iter().enumerate() {
            let channel = N_CHANNELS - 1 - (i % N_CHANNELS);
            min[channel] = min[channel].min(value);
            max[channel] = max[channel].max(value);
        }
        board.end()?;
        debug!(?min, ?max, "Vernier calibration complete");
        Ok((min, max))
    }

    /// Full calibration: pedestal over `n_pedestal` acquisitions, then
    /// verniers.
    pub fn calibrate(
        identifier: &str,
        root: &Value,
        master: Arc<BusMaster>,
        n_pedestal: usize,
    ) -> Result<DigitizerCalibration> {
        let pedestal = Self::measure_pedestal(identifier, root, Arc::clone(&master), n_pedestal)?;
        let (min, max) = Self::calibrate_verniers(identifier, root, master)?;
        DigitizerCalibration::new(pedestal, min, max)
    }
}

impl Drop for V1729 {
    fn drop(&mut self) {
        if let Err(err) = self.board.end() {
            warn!(device = %self.board.name(), %err, "Failed to reset V1729");
        }
    }
}
