//! Bus backend port.
//!
//! A [`BusBackend`] is the capability a VME bridge driver provides to the
//! [`BusMaster`](crate::master::BusMaster): single cycles, block cycles and
//! interrupt handling against one open controller session. Implementations
//! report raw [`BusFault`]s; the master tags them with the controller
//! identity.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::BusErrorKind;
use crate::spec::{AddressModifier, DataWidth, TransferMode};

bitflags! {
    /// Set of VME interrupt request levels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IrqMask: u8 {
        /// IRQ level 1
        const IRQ1 = 0x01;
        /// IRQ level 2
        const IRQ2 = 0x02;
        /// IRQ level 3
        const IRQ3 = 0x04;
        /// IRQ level 4
        const IRQ4 = 0x08;
        /// IRQ level 5
        const IRQ5 = 0x10;
        /// IRQ level 6
        const IRQ6 = 0x20;
        /// IRQ level 7
        const IRQ7 = 0x40;
    }
}

impl IrqMask {
    /// Names accepted in configuration files, in level order.
    pub const LEVELS: &'static [(&'static str, IrqMask)] = &[
        ("IRQ1", IrqMask::IRQ1),
        ("IRQ2", IrqMask::IRQ2),
        ("IRQ3", IrqMask::IRQ3),
        ("IRQ4", IrqMask::IRQ4),
        ("IRQ5", IrqMask::IRQ5),
        ("IRQ6", IrqMask::IRQ6),
        ("IRQ7", IrqMask::IRQ7),
    ];
}

/// Raw fault reported by a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusFault {
    /// VME bus error.
    Bus,
    /// Communication error with the controller.
    Communication,
    /// Invalid parameter.
    InvalidParameter,
    /// Timeout.
    Timeout,
    /// Any other vendor status code.
    Other(i32),
}

impl BusFault {
    /// Map onto the public fault classes.
    pub fn kind(self) -> BusErrorKind {
        match self {
            BusFault::Bus => BusErrorKind::Bus,
            BusFault::Communication => BusErrorKind::Communication,
            BusFault::InvalidParameter => BusErrorKind::InvalidParameter,
            BusFault::Timeout => BusErrorKind::Timeout,
            BusFault::Other(_) => BusErrorKind::Generic,
        }
    }
}

impl fmt::Display for BusFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusFault::Bus => write!(f, "VME bus error"),
            BusFault::Communication => write!(f, "communication error"),
            BusFault::InvalidParameter => write!(f, "invalid parameter"),
            BusFault::Timeout => write!(f, "timeout"),
            BusFault::Other(code) => write!(f, "unspecified error (code {code})"),
        }
    }
}

/// Result of a backend call.
pub type BackendResult<T> = std::result::Result<T, BusFault>;

/// Outcome of one backend block cycle.
///
/// Block cycles can fail half way, so the element count is reported even
/// when a fault ends the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOutcome {
    /// Elements actually moved.
    pub transferred: usize,
    /// Fault that ended the cycle early, if any.
    pub fault: Option<BusFault>,
}

impl BlockOutcome {
    /// Cycle that moved `transferred` elements without a fault.
    pub fn complete(transferred: usize) -> Self {
        Self {
            transferred,
            fault: None,
        }
    }

    /// Cycle ended by `fault` after `transferred` elements.
    pub fn faulted(transferred: usize, fault: BusFault) -> Self {
        Self {
            transferred,
            fault: Some(fault),
        }
    }
}

/// Per-backend block length limits.
///
/// Some controllers cannot sustain the nominal VME64 block length for every
/// mode. A limit set here caps the length used by the master; it can never
/// raise it above the protocol maximum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendLimits {
    block_elements: HashMap<TransferMode, usize>,
}

impl BackendLimits {
    /// Protocol limits only.
    pub fn nominal() -> Self {
        Self::default()
    }

    /// Cap block transfers in `mode` at `elements` per backend call.
    pub fn with_block_limit(mut self, mode: TransferMode, elements: usize) -> Self {
        self.block_elements.insert(mode, elements.max(1));
        self
    }

    /// Tightest limit of `self` and `other` for every mode.
    pub fn combine(mut self, other: &BackendLimits) -> Self {
        for (&mode, &limit) in &other.block_elements {
            let entry = self.block_elements.entry(mode).or_insert(limit);
            *entry = (*entry).min(limit);
        }
        self
    }

    /// Effective maximum elements per block call in `mode`.
    pub fn max_block_elements(&self, mode: TransferMode) -> usize {
        let nominal = mode.max_block_elements();
        self.block_elements
            .get(&mode)
            .map_or(nominal, |&limit| limit.min(nominal))
    }
}

/// Capability interface of a VME bridge driver.
///
/// Block elements travel as `u64` words, each holding one element of
/// `width` in its low bits. Every call operates on the session opened by
/// [`open`](BusBackend::open).
pub trait BusBackend: Send {
    /// Open the controller session on `link_index`/`board_index`.
    fn open(&mut self, link_index: u16, board_index: u16) -> BackendResult<()>;

    /// Close the session. Called once when the owning master is dropped.
    fn close(&mut self) -> BackendResult<()>;

    /// Single read cycle.
    fn read_single(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
    ) -> BackendResult<u64>;

    /// Single write cycle.
    fn write_single(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        value: u64,
    ) -> BackendResult<()>;

    /// Block read of at most `buf.len()` elements into `buf`.
    fn read_block(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        buf: &mut [u64],
    ) -> BlockOutcome;

    /// Block write of at most `buf.len()` elements from `buf`.
    fn write_block(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        buf: &[u64],
    ) -> BlockOutcome;

    /// Enable interrupt delivery for `mask`.
    fn enable_irq(&mut self, mask: IrqMask) -> BackendResult<()>;

    /// Block until one of the levels in `mask` fires or `timeout` elapses.
    fn wait_irq(&mut self, mask: IrqMask, timeout: Duration) -> BackendResult<()>;

    /// Block length limits of this controller.
    fn limits(&self) -> BackendLimits {
        BackendLimits::nominal()
    }
}
