//! VME bus master.
//!
//! A [`BusMaster`] owns one open controller session. It resolves address
//! modifiers, splits block transfers into backend-sized chunks, tags backend
//! faults with the controller identity and serializes all bus traffic: a
//! physical bus carries one transaction at a time, so every single cycle,
//! every complete chunked block transfer and every IRQ wait holds the
//! session lock.
//!
//! Masters are shared with slave devices through `Arc<BusMaster>`. The
//! session is closed when the last reference is dropped.

use std::ops::Range;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::backend::{BackendLimits, BlockOutcome, BusBackend, BusFault, IrqMask};
use crate::error::{BusError, ConfigError, Result, VmeError};
use crate::settings::{Settings, Translator};
use crate::spec::{AddressModifier, AddressingMode, TransferMode};

/// IRQ level names accepted by the `IRQ` key.
pub const IRQ_LEVELS: Translator<IrqMask> = Translator::new(IrqMask::LEVELS);

/// Default IRQ wait timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Controller session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    /// Controller name used in logs and errors.
    pub name: String,
    /// Link index of the controller.
    pub link_index: u16,
    /// Board index on the link.
    pub board_index: u16,
    /// Interrupt levels to wait on.
    pub irq: IrqMask,
    /// IRQ wait timeout.
    pub timeout: Duration,
}

impl MasterConfig {
    /// Session on link 0, board 0, no IRQs, default timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link_index: 0,
            board_index: 0,
            irq: IrqMask::empty(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Set link and board index.
    pub fn with_indices(mut self, link_index: u16, board_index: u16) -> Self {
        self.link_index = link_index;
        self.board_index = board_index;
        self
    }

    /// Set the IRQ levels.
    pub fn with_irq(mut self, irq: IrqMask) -> Self {
        self.irq = irq;
        self
    }

    /// Set the IRQ wait timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Read `linkIndex`, `boardIndex`, `IRQ` and `timeout` (ms).
    ///
    /// # Errors
    ///
    /// Missing indices, a missing or empty `IRQ` list, unknown IRQ names and
    /// a zero timeout are configuration errors.
    pub fn from_settings(
        name: impl Into<String>,
        settings: &mut Settings,
    ) -> std::result::Result<Self, ConfigError> {
        let link_index = settings.get("linkIndex")?;
        let board_index = settings.get("boardIndex")?;
        let irq = settings
            .translate_vec("IRQ", &IRQ_LEVELS)?
            .into_iter()
            .fold(IrqMask::empty(), |acc, level| acc | level);
        if irq.is_empty() {
            return Err(settings.value_error("IRQ", "[]"));
        }
        let timeout_ms: u64 = settings.get_or("timeout", DEFAULT_TIMEOUT_MS)?;
        if timeout_ms == 0 {
            return Err(settings.value_error("timeout", timeout_ms));
        }
        Ok(Self {
            name: name.into(),
            link_index,
            board_index,
            irq,
            timeout: Duration::from_millis(timeout_ms),
        })
    }
}

/// Result of a chunked block transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransfer {
    /// Elements requested by the caller.
    pub requested: usize,
    /// Elements actually moved.
    pub transferred: usize,
    /// Fault that stopped the transfer early.
    pub fault: Option<BusError>,
}

impl BlockTransfer {
    /// All requested elements moved without a fault.
    pub fn is_complete(&self) -> bool {
        self.fault.is_none() && self.transferred == self.requested
    }

    /// Convert an incomplete transfer into an error.
    ///
    /// A backend fault is returned as is; a silent short transfer becomes a
    /// protocol error for `device`.
    pub fn require_complete(self, device: &str) -> Result<usize> {
        if let Some(fault) = self.fault {
            return Err(fault.into());
        }
        if self.transferred != self.requested {
            return Err(VmeError::protocol(
                device,
                format!(
                    "Block transfer moved {} of {} elements",
                    self.transferred, self.requested
                ),
            ));
        }
        Ok(self.transferred)
    }
}

/// Data returned by [`BusMaster::read_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRead {
    /// Elements read; `values.len() == transfer.transferred`.
    pub values: Vec<u64>,
    /// Transfer summary.
    pub transfer: BlockTransfer,
}

/// Exclusive owner of one VME controller session.
pub struct BusMaster {
    config: MasterConfig,
    limits: BackendLimits,
    backend: Mutex<Box<dyn BusBackend>>,
    span: Span,
}

impl BusMaster {
    /// Open the controller session described by `config`.
    ///
    /// IRQ delivery is enabled for the configured levels.
    ///
    /// # Errors
    ///
    /// Returns a bus error if the backend fails to open or to enable IRQs,
    /// and a protocol error for a zero timeout.
    pub fn open(config: MasterConfig, backend: Box<dyn BusBackend>) -> Result<Self> {
        Self::open_with_limits(config, backend, &BackendLimits::nominal())
    }

    /// Open the session, additionally capping block lengths at `limits`.
    ///
    /// Used by bridge models that de-rate a mode on top of what the driver
    /// reports.
    pub fn open_with_limits(
        config: MasterConfig,
        mut backend: Box<dyn BusBackend>,
        limits: &BackendLimits,
    ) -> Result<Self> {
        let span = info_span!(
            "vme_master",
            device = %config.name,
            link = config.link_index,
            board = config.board_index
        );
        let entered = span.enter();

        if config.timeout.is_zero() {
            return Err(VmeError::protocol(&config.name, "IRQ timeout must be positive"));
        }

        backend
            .open(config.link_index, config.board_index)
            .map_err(|fault| bus_error(&config, fault, "Unable to open controller session"))?;

        if !config.irq.is_empty() {
            if let Err(fault) = backend.enable_irq(config.irq) {
                if let Err(close) = backend.close() {
                    warn!(%close, "Error closing controller after failed IRQ setup");
                }
                return Err(bus_error(&config, fault, "Unable to enable IRQ"));
            }
        }

        let limits = backend.limits().combine(limits);
        info!(
            irq = config.irq.bits(),
            timeout_ms = config.timeout.as_millis() as u64,
            "Opened VME controller"
        );
        drop(entered);

        Ok(Self {
            config,
            limits,
            backend: Mutex::new(backend),
            span,
        })
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Session parameters.
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Tracing span of this controller; slave spans are children of it.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Effective maximum elements per backend block call in `mode`.
    pub fn max_block_elements(&self, mode: TransferMode) -> usize {
        self.limits.max_block_elements(mode)
    }

    // =========================================================================
    // Single cycles
    // =========================================================================

    /// Read one element at `address`.
    ///
    /// Only non-multiplexed modes are valid. Bus faults are raised
    /// immediately.
    pub fn read_single(
        &self,
        addressing: AddressingMode,
        mode: TransferMode,
        address: u64,
    ) -> Result<u64> {
        let _entered = self.span.enter();
        let modifier = AddressModifier::single(addressing, mode)?;
        self.check_address(addressing, address)?;
        let value = self
            .backend
            .lock()
            .read_single(address, modifier, mode.data_width())
            .map_err(|fault| {
                self.fault(fault, format!("Single read failed at 0x{address:08X}"))
            })?;
        trace!(address = format_args!("0x{address:08X}"), value, %mode, "read");
        Ok(value)
    }

    /// Write one element to `address`.
    pub fn write_single(
        &self,
        addressing: AddressingMode,
        mode: TransferMode,
        address: u64,
        value: u64,
    ) -> Result<()> {
        let _entered = self.span.enter();
        let modifier = AddressModifier::single(addressing, mode)?;
        self.check_address(addressing, address)?;
        self.backend
            .lock()
            .write_single(address, modifier, mode.data_width(), value)
            .map_err(|fault| {
                self.fault(fault, format!("Single write failed at 0x{address:08X}"))
            })?;
        trace!(address = format_args!("0x{address:08X}"), value, %mode, "write");
        Ok(())
    }

    // =========================================================================
    // Block transfers
    // =========================================================================

    /// Read `count` elements from `address` in `mode`.
    ///
    /// The result holds only the elements actually transferred; a fault or
    /// an empty backend cycle ends the transfer early.
    pub fn read_block(
        &self,
        addressing: AddressingMode,
        mode: TransferMode,
        address: u64,
        count: usize,
    ) -> Result<BlockRead> {
        let mut values = vec![0u64; count];
        let transfer = self.read_block_into(addressing, mode, address, &mut values)?;
        values.truncate(transfer.transferred);
        Ok(BlockRead { values, transfer })
    }

    /// Read up to `buf.len()` elements from `address` into `buf`.
    ///
    /// Every chunk targets the same bus address.
    pub fn read_block_into(
        &self,
        addressing: AddressingMode,
        mode: TransferMode,
        address: u64,
        buf: &mut [u64],
    ) -> Result<BlockTransfer> {
        let _entered = self.span.enter();
        let modifier = AddressModifier::block(addressing, mode)?;
        self.check_address(addressing, address)?;
        let width = mode.data_width();
        let transfer = self.chunked(buf.len(), self.max_block_elements(mode), |backend, range| {
            backend.read_block(address, modifier, width, &mut buf[range])
        });
        debug!(
            address = format_args!("0x{address:08X}"),
            %mode,
            requested = transfer.requested,
            transferred = transfer.transferred,
            "block read"
        );
        Ok(transfer)
    }

    /// Write `data` to `address` in `mode`.
    pub fn write_block(
        &self,
        addressing: AddressingMode,
        mode: TransferMode,
        address: u64,
        data: &[u64],
    ) -> Result<BlockTransfer> {
        let _entered = self.span.enter();
        let modifier = AddressModifier::block(addressing, mode)?;
        self.check_address(addressing, address)?;
        let width = mode.data_width();
        let transfer = self.chunked(data.len(), self.max_block_elements(mode), |backend, range| {
            backend.write_block(address, modifier, width, &data[range])
        });
        debug!(
            address = format_args!("0x{address:08X}"),
            %mode,
            requested = transfer.requested,
            transferred = transfer.transferred,
            "block write"
        );
        Ok(transfer)
    }

    /// Issue `ceil(requested / max_block)` backend cycles while each one
    /// moves data, holding the session for the whole transfer.
    fn chunked<F>(&self, requested: usize, max_block: usize, mut cycle: F) -> BlockTransfer
    where
        F: FnMut(&mut dyn BusBackend, Range<usize>) -> BlockOutcome,
    {
        let mut backend = self.backend.lock();
        let mut transferred = 0;
        let mut fault = None;

        while transferred < requested {
            let n = (requested - transferred).min(max_block);
            let outcome = cycle(&mut **backend, transferred..transferred + n);
            let moved = outcome.transferred.min(n);
            transferred += moved;

            if let Some(raw) = outcome.fault {
                warn!(%raw, transferred, requested, "Block transfer interrupted");
                fault = Some(self.fault_error(
                    raw,
                    format!("Block transfer stopped after {transferred} of {requested} elements"),
                ));
                break;
            }
            if moved == 0 {
                warn!(transferred, requested, "Block transfer returned no data");
                break;
            }
        }

        BlockTransfer {
            requested,
            transferred,
            fault,
        }
    }

    // =========================================================================
    // Interrupts
    // =========================================================================

    /// Wait for the configured IRQ levels with the configured timeout.
    pub fn wait_for_irq(&self) -> Result<()> {
        self.wait_for_irq_timeout(self.config.timeout)
    }

    /// Wait for the configured IRQ levels for at most `timeout`.
    ///
    /// The levels are re-armed before every wait since the bridge disarms
    /// them once an interrupt is acknowledged. Expiry is reported as a bus
    /// error of kind [`Timeout`](crate::error::BusErrorKind::Timeout).
    pub fn wait_for_irq_timeout(&self, timeout: Duration) -> Result<()> {
        let _entered = self.span.enter();
        trace!(timeout_ms = timeout.as_millis() as u64, "Waiting for IRQ");
        let mut backend = self.backend.lock();
        if !self.config.irq.is_empty() {
            backend
                .enable_irq(self.config.irq)
                .map_err(|fault| self.fault(fault, "Failed to enable IRQ"))?;
        }
        backend
            .wait_irq(self.config.irq, timeout)
            .map_err(|fault| self.fault(fault, "IRQ wait failed"))
    }

    fn check_address(&self, addressing: AddressingMode, address: u64) -> Result<()> {
        if addressing.contains(address) {
            Ok(())
        } else {
            Err(VmeError::AddressOutOfRange {
                device: self.config.name.clone(),
                addressing,
                address,
            })
        }
    }

    fn fault_error(&self, fault: BusFault, message: impl Into<String>) -> BusError {
        let message = format!("{}: {}", message.into(), fault);
        BusError::new(
            fault.kind(),
            &self.config.name,
            self.config.link_index,
            self.config.board_index,
            message,
        )
    }

    fn fault(&self, fault: BusFault, message: impl Into<String>) -> VmeError {
        self.fault_error(fault, message).into()
    }
}

impl std::fmt::Debug for BusMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusMaster")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Drop for BusMaster {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        debug!("Closing VME controller");
        if let Err(fault) = self.backend.get_mut().close() {
            warn!(%fault, "Error closing VME controller");
        }
    }
}

fn bus_error(config: &MasterConfig, fault: BusFault, message: &str) -> VmeError {
    BusError::new(
        fault.kind(),
        &config.name,
        config.link_index,
        config.board_index,
        format!("{message}: {fault}"),
    )
    .into()
}
