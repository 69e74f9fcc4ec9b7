//! Behavioural model of a V1729 on the simulated bridge.
//!
//! [`V1729Model::install`] registers hooks on a [`SimulatedBackend`] so that
//! the board driver can be exercised without hardware:
//!
//! - RESET drops queued memory and pending interrupts
//! - START_ACQUISITION fills RAM_DATA with one memory image and sets TRIG_REC
//! - reading TRIG_REC re-arms the next acquisition when auto-restart is on
//!
//! With NB_OF_COLS_TO_READ set to zero the image is the vernier calibration
//! dump; otherwise a full memory with header verniers, a flat pedestal with
//! uniform noise and, unless the trigger is random, a negative pulse on every
//! channel.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{trace, warn};
use vme_core::simulated::SimState;
use vme_core::{IrqMask, SimulatedBackend};

use super::buffer::{pack_words, DigitizerBuffer};
use super::calibration::DigitizerCalibration;
use super::spec::{
    mode, registers, trigger_settings, Submodel, INTRINSIC_POSTTRIG, MEMORY_HEADER_SIZE,
    MEMORY_SIZE, MEMORY_VERNIER_INDEX, N_CELLS, N_CHANNELS, VERNIER_MEMORY_SIZE,
};

/// Synthetic signal parameters of a simulated V1729.
#[derive(Debug, Clone, PartialEq)]
pub struct V1729Model {
    /// Board base address.
    pub base: u64,
    /// Level raised at the end of an acquisition.
    pub irq: IrqMask,
    /// Bytes per block word (8 for MBLT).
    pub word_bytes: usize,
    /// Baseline of every memory word.
    pub pedestal: u16,
    /// Peak-to-peak uniform noise added to the baseline.
    pub noise: u16,
    /// Smallest vernier value.
    pub vernier_min: u16,
    /// Largest vernier value.
    pub vernier_max: u16,
    /// First decoded sample of the pulse.
    pub pulse_start: usize,
    /// Pulse length in samples.
    pub pulse_width: usize,
    /// Pulse depth below the baseline.
    pub pulse_height: u16,
    /// Random generator seed.
    pub seed: u64,
}

impl V1729Model {
    /// Noise-free board at `base` raising IRQ1.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            irq: IrqMask::IRQ1,
            word_bytes: 8,
            pedestal: 1000,
            noise: 0,
            vernier_min: 1200,
            vernier_max: 3400,
            pulse_start: 1000,
            pulse_width: 20,
            pulse_height: 200,
            seed: 1729,
        }
    }

    /// Use `irq` for end of acquisition.
    pub fn with_irq(mut self, irq: IrqMask) -> Self {
        self.irq = irq;
        self
    }

    /// Add uniform noise of `noise` counts.
    pub fn with_noise(mut self, noise: u16) -> Self {
        self.noise = noise;
        self
    }

    /// Pulse of `height` counts over `width` samples from `start`.
    pub fn with_pulse(mut self, start: usize, width: usize, height: u16) -> Self {
        self.pulse_start = start;
        self.pulse_width = width;
        self.pulse_height = height;
        self
    }

    /// Block word size of the readout mode.
    pub fn with_word_bytes(mut self, word_bytes: usize) -> Self {
        self.word_bytes = word_bytes;
        self
    }

    /// Expected integral of the pulse on one channel after pedestal
    /// subtraction.
    pub fn pulse_integral(&self) -> i64 {
        -(self.pulse_width as i64) * i64::from(self.pulse_height)
    }

    /// Register the board hooks on `bridge`.
    pub fn install(self, bridge: &SimulatedBackend) {
        let model = Arc::new(self);
        let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(model.seed)));

        let reset = Arc::clone(&model);
        bridge.on_write(model.base + registers::RESET, move |state, _| {
            state.clear_reads(reset.base + registers::RAM_DATA);
            state.clear_irq(reset.irq);
        });

        let (start, start_rng) = (Arc::clone(&model), Arc::clone(&rng));
        bridge.on_write(model.base + registers::START_ACQUISITION, move |state, _| {
            start.acquire(state, &mut start_rng.lock());
        });

        let (restart, restart_rng) = (Arc::clone(&model), rng);
        bridge.on_read(model.base + registers::TRIG_REC, move |state| {
            let mode_register = restart.register(state, registers::MODE_REGISTER);
            if mode_register & (1 << mode::AUTO_RESTART_SHIFT) != 0 {
                trace!("Simulated V1729 auto restart");
                restart.acquire(state, &mut restart_rng.lock());
            }
        });
    }

    fn register(&self, state: &SimState, offset: u64) -> u64 {
        state.register(self.base + offset).unwrap_or(0)
    }

    fn submodel(&self, state: &SimState) -> Submodel {
        if self.register(state, registers::MODE_REGISTER) & Submodel::V1729A.bit_mode() != 0 {
            Submodel::V1729A
        } else {
            Submodel::V1729
        }
    }

    fn acquire(&self, state: &mut SimState, rng: &mut StdRng) {
        let memory = if self.register(state, registers::NB_OF_COLS_TO_READ) == 0 {
            self.vernier_image(rng)
        } else {
            let trig_rec = rng.gen_range(0..N_CELLS as u16);
            state.set_register(self.base + registers::TRIG_REC, u64::from(trig_rec));
            self.memory_image(state, rng, trig_rec)
        };
        let data = self.base + registers::RAM_DATA;
        state.clear_reads(data);
        state.queue_reads(data, pack_words(&memory, self.word_bytes));
        if self.register(state, registers::MODE_REGISTER) & mode::ENABLE_IRQ != 0 {
            state.raise_irq(self.irq);
        }
    }

    fn vernier_image(&self, rng: &mut StdRng) -> Vec<u16> {
        (0..VERNIER_MEMORY_SIZE)
            .map(|i| match i / N_CHANNELS {
                0 => self.vernier_min,
                1 => self.vernier_max,
                _ => rng.gen_range(self.vernier_min..=self.vernier_max),
            })
            .collect()
    }

    fn memory_image(&self, state: &SimState, rng: &mut StdRng, trig_rec: u16) -> Vec<u16> {
        let mut memory: Vec<u16> = (0..MEMORY_SIZE)
            .map(|i| {
                if i < MEMORY_HEADER_SIZE {
                    0
                } else {
                    self.pedestal.saturating_add(rng.gen_range(0..=self.noise))
                }
            })
            .collect();
        for k in 0..N_CHANNELS {
            memory[MEMORY_VERNIER_INDEX + k] = rng.gen_range(self.vernier_min..=self.vernier_max);
        }

        let random = self.register(state, registers::TRIGGER_TYPE)
            & u64::from(trigger_settings::RANDOM)
            != 0;
        if !random && self.pulse_height > 0 {
            self.add_pulse(state, &mut memory, trig_rec);
        }
        memory
    }

    /// Place the pulse where the decoder will find it.
    fn add_pulse(&self, state: &SimState, memory: &mut [u16], trig_rec: u16) {
        let post_trig = ((self.register(state, registers::POSTTRIG.lsb)
            | self.register(state, registers::POSTTRIG.msb) << 8) as u16)
            .saturating_add(INTRINSIC_POSTTRIG);
        let geometry = DigitizerCalibration {
            pedestal: vec![0; MEMORY_SIZE],
            vernier_min: [self.vernier_min; N_CHANNELS],
            vernier_max: [self.vernier_max; N_CHANNELS],
            post_trig,
        };

        let mut image = DigitizerBuffer::new(self.submodel(state));
        image.raw_mut().copy_from_slice(memory);
        if let Err(err) = image.calibrate(Arc::new(geometry), trig_rec) {
            warn!(%err, "Simulated V1729 cannot place pulse");
            return;
        }
        for channel in 0..N_CHANNELS {
            for index in self.pulse_start..self.pulse_start + self.pulse_width {
                if let Ok(word) = image.fold_index(channel, index) {
                    memory[word] = memory[word].saturating_sub(self.pulse_height);
                }
            }
        }
    }
}
