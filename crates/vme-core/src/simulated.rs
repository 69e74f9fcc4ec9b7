//! Simulated VME bridge.
//!
//! [`SimulatedBackend`] implements [`BusBackend`] on an in-memory register
//! file. It records every call, replays queued read data, supports fault
//! injection for resilience tests and delivers interrupts raised from other
//! threads or from read/write hooks.
//!
//! Cloning a `SimulatedBackend` yields a second handle on the same bridge, so
//! a test can hand one clone to a [`BusMaster`](crate::master::BusMaster) and
//! inspect the call log through the other.
//!
//! ```
//! use std::time::Duration;
//! use vme_core::backend::{BusBackend, IrqMask};
//! use vme_core::simulated::SimulatedBackend;
//!
//! let mut bridge = SimulatedBackend::new();
//! bridge.open(0, 0).unwrap();
//! bridge.raise_irq(IrqMask::IRQ3);
//! assert!(bridge.wait_irq(IrqMask::IRQ3, Duration::from_millis(10)).is_ok());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::backend::{
    BackendLimits, BackendResult, BlockOutcome, BusBackend, BusFault, IrqMask,
};
use crate::spec::{AddressModifier, DataWidth};

/// Backend operation, used to target fault injection and inspect the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Session open
    Open,
    /// Single read cycle
    ReadSingle,
    /// Single write cycle
    WriteSingle,
    /// Block read cycle
    ReadBlock,
    /// Block write cycle
    WriteBlock,
    /// IRQ enable
    EnableIrq,
    /// IRQ wait
    WaitIrq,
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    /// Session opened.
    Open { link_index: u16, board_index: u16 },
    /// Session closed.
    Close,
    /// Single read cycle.
    ReadSingle {
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
    },
    /// Single write cycle.
    WriteSingle {
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        value: u64,
    },
    /// Block read cycle.
    ReadBlock {
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        requested: usize,
        transferred: usize,
    },
    /// Block write cycle.
    WriteBlock {
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        requested: usize,
        transferred: usize,
    },
    /// Interrupts enabled.
    EnableIrq(IrqMask),
    /// Interrupt wait.
    WaitIrq { mask: IrqMask, timeout: Duration },
}

/// Fault injection scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultScenario {
    /// Fail the next call of `operation`.
    Once { operation: Operation, fault: BusFault },
    /// Let `count` calls of `operation` succeed, then fail every later one.
    FailAfterN {
        operation: Operation,
        count: usize,
        fault: BusFault,
    },
    /// The next block cycle of `operation` moves `transferred` elements and
    /// then stops with `fault`.
    PartialBlock {
        operation: Operation,
        transferred: usize,
        fault: BusFault,
    },
    /// Every call fails with a communication error.
    CommunicationLoss,
}

/// Hook run after a single write to its address.
pub type WriteHook = Box<dyn FnMut(&mut SimState, u64) + Send>;

/// Hook run after a single read of its address has produced its value.
pub type ReadHook = Box<dyn FnMut(&mut SimState) + Send>;

/// Mutable state of the simulated bridge, visible to write hooks.
#[derive(Default)]
pub struct SimState {
    session: Option<(u16, u16)>,
    registers: HashMap<u64, u64>,
    read_queues: HashMap<u64, VecDeque<u64>>,
    block_writes: HashMap<u64, Vec<u64>>,
    calls: Vec<BusCall>,
    scenarios: Vec<(FaultScenario, bool)>,
    op_counts: HashMap<Operation, usize>,
    enabled_irq: IrqMask,
    pending_irq: IrqMask,
    hooks: HashMap<u64, WriteHook>,
    read_hooks: HashMap<u64, ReadHook>,
}

impl SimState {
    /// Last value written to (or preset at) `address`.
    pub fn register(&self, address: u64) -> Option<u64> {
        self.registers.get(&address).copied()
    }

    /// Preset the value single reads at `address` return.
    pub fn set_register(&mut self, address: u64, value: u64) {
        self.registers.insert(address, value);
    }

    /// Queue data returned by later reads at `address`, before the register value.
    pub fn queue_reads<I: IntoIterator<Item = u64>>(&mut self, address: u64, values: I) {
        self.read_queues.entry(address).or_default().extend(values);
    }

    /// Number of queued words at `address`.
    pub fn queued(&self, address: u64) -> usize {
        self.read_queues.get(&address).map_or(0, VecDeque::len)
    }

    /// Drop the words queued at `address`.
    pub fn clear_reads(&mut self, address: u64) {
        self.read_queues.remove(&address);
    }

    /// Mark `mask` as pending.
    pub fn raise_irq(&mut self, mask: IrqMask) {
        self.pending_irq |= mask;
    }

    /// Withdraw pending levels in `mask`.
    pub fn clear_irq(&mut self, mask: IrqMask) {
        self.pending_irq.remove(mask);
    }

    fn take_fault(&mut self, operation: Operation) -> Option<(BusFault, Option<usize>)> {
        let count = {
            let count = self.op_counts.entry(operation).or_insert(0);
            *count += 1;
            *count
        };
        for (scenario, consumed) in self.scenarios.iter_mut() {
            if *consumed {
                continue;
            }
            match *scenario {
                FaultScenario::CommunicationLoss => {
                    return Some((BusFault::Communication, None));
                }
                FaultScenario::Once { operation: op, fault } if op == operation => {
                    *consumed = true;
                    return Some((fault, None));
                }
                FaultScenario::FailAfterN {
                    operation: op,
                    count: n,
                    fault,
                } if op == operation && count > n => {
                    return Some((fault, None));
                }
                FaultScenario::PartialBlock {
                    operation: op,
                    transferred,
                    fault,
                } if op == operation => {
                    *consumed = true;
                    return Some((fault, Some(transferred)));
                }
                _ => {}
            }
        }
        None
    }

    fn require_session(&self) -> BackendResult<()> {
        self.session.map(|_| ()).ok_or(BusFault::Communication)
    }
}

struct Shared {
    state: Mutex<SimState>,
    irq: Condvar,
    limits: BackendLimits,
}

/// In-memory VME bridge.
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// Bridge with nominal block limits.
    pub fn new() -> Self {
        Self::with_limits(BackendLimits::nominal())
    }

    /// Bridge with custom block limits.
    pub fn with_limits(limits: BackendLimits) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SimState::default()),
                irq: Condvar::new(),
                limits,
            }),
        }
    }

    /// Add a fault scenario.
    pub fn inject(&self, scenario: FaultScenario) {
        self.shared.state.lock().scenarios.push((scenario, false));
    }

    /// Run `hook` after every single write to `address`.
    pub fn on_write<F>(&self, address: u64, hook: F)
    where
        F: FnMut(&mut SimState, u64) + Send + 'static,
    {
        self.shared.state.lock().hooks.insert(address, Box::new(hook));
    }

    /// Run `hook` after every single read of `address`.
    pub fn on_read<F>(&self, address: u64, hook: F)
    where
        F: FnMut(&mut SimState) + Send + 'static,
    {
        self.shared.state.lock().read_hooks.insert(address, Box::new(hook));
    }

    /// Run `f` with exclusive access to the bridge state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let result = f(&mut *self.shared.state.lock());
        self.shared.irq.notify_all();
        result
    }

    /// Raise interrupt levels, waking any waiter.
    pub fn raise_irq(&self, mask: IrqMask) {
        self.with_state(|state| state.raise_irq(mask));
    }

    /// Preset the value single reads at `address` return.
    pub fn set_register(&self, address: u64, value: u64) {
        self.with_state(|state| state.set_register(address, value));
    }

    /// Queue data returned by later reads at `address`.
    pub fn queue_reads<I: IntoIterator<Item = u64>>(&self, address: u64, values: I) {
        self.with_state(|state| state.queue_reads(address, values));
    }

    /// Last value written to `address`.
    pub fn register(&self, address: u64) -> Option<u64> {
        self.shared.state.lock().register(address)
    }

    /// Values of every single write to `address`, in order.
    pub fn writes_to(&self, address: u64) -> Vec<u64> {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BusCall::WriteSingle {
                    address: a, value, ..
                } if *a == address => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Data received by block writes to `address`.
    pub fn block_data(&self, address: u64) -> Vec<u64> {
        self.shared
            .state
            .lock()
            .block_writes
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of the call log.
    pub fn calls(&self) -> Vec<BusCall> {
        self.shared.state.lock().calls.clone()
    }

    /// Block read calls as `(requested, transferred)` pairs.
    pub fn block_reads(&self) -> Vec<(usize, usize)> {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BusCall::ReadBlock {
                    requested,
                    transferred,
                    ..
                } => Some((*requested, *transferred)),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.shared.state.lock().calls.clear();
    }

    /// Whether a session is open.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().session.is_some()
    }
}

impl BusBackend for SimulatedBackend {
    fn open(&mut self, link_index: u16, board_index: u16) -> BackendResult<()> {
        let mut state = self.shared.state.lock();
        if let Some((fault, _)) = state.take_fault(Operation::Open) {
            return Err(fault);
        }
        if state.session.is_some() {
            return Err(BusFault::InvalidParameter);
        }
        state.session = Some((link_index, board_index));
        state.calls.push(BusCall::Open {
            link_index,
            board_index,
        });
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        let mut state = self.shared.state.lock();
        state.require_session()?;
        state.session = None;
        state.calls.push(BusCall::Close);
        Ok(())
    }

    fn read_single(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
    ) -> BackendResult<u64> {
        let value = {
            let mut state = self.shared.state.lock();
            state.require_session()?;
            state.calls.push(BusCall::ReadSingle {
                address,
                modifier,
                width,
            });
            if let Some((fault, _)) = state.take_fault(Operation::ReadSingle) {
                return Err(fault);
            }
            let queued = state
                .read_queues
                .get_mut(&address)
                .and_then(VecDeque::pop_front);
            let value = queued.or_else(|| state.register(address)).unwrap_or(0);
            if let Some(mut hook) = state.read_hooks.remove(&address) {
                hook(&mut *state);
                state.read_hooks.insert(address, hook);
            }
            value
        };
        self.shared.irq.notify_all();
        Ok(value & width.mask())
    }

    fn write_single(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        value: u64,
    ) -> BackendResult<()> {
        let value = value & width.mask();
        {
            let mut state = self.shared.state.lock();
            state.require_session()?;
            state.calls.push(BusCall::WriteSingle {
                address,
                modifier,
                width,
                value,
            });
            if let Some((fault, _)) = state.take_fault(Operation::WriteSingle) {
                return Err(fault);
            }
            state.registers.insert(address, value);
            if let Some(mut hook) = state.hooks.remove(&address) {
                hook(&mut *state, value);
                state.hooks.insert(address, hook);
            }
        }
        self.shared.irq.notify_all();
        Ok(())
    }

    fn read_block(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        buf: &mut [u64],
    ) -> BlockOutcome {
        let mut state = self.shared.state.lock();
        if let Err(fault) = state.require_session() {
            return BlockOutcome::faulted(0, fault);
        }
        let fault = state.take_fault(Operation::ReadBlock);
        let limit = match fault {
            Some((_, Some(partial))) => partial.min(buf.len()),
            Some((_, None)) => 0,
            None => buf.len(),
        };
        let mut transferred = 0;
        if let Some(queue) = state.read_queues.get_mut(&address) {
            for slot in buf.iter_mut().take(limit) {
                match queue.pop_front() {
                    Some(word) => {
                        *slot = word & width.mask();
                        transferred += 1;
                    }
                    None => break,
                }
            }
        }
        state.calls.push(BusCall::ReadBlock {
            address,
            modifier,
            width,
            requested: buf.len(),
            transferred,
        });
        trace!(address, requested = buf.len(), transferred, "Simulated block read");
        match fault {
            Some((fault, _)) => BlockOutcome::faulted(transferred, fault),
            None => BlockOutcome::complete(transferred),
        }
    }

    fn write_block(
        &mut self,
        address: u64,
        modifier: AddressModifier,
        width: DataWidth,
        buf: &[u64],
    ) -> BlockOutcome {
        let mut state = self.shared.state.lock();
        if let Err(fault) = state.require_session() {
            return BlockOutcome::faulted(0, fault);
        }
        let fault = state.take_fault(Operation::WriteBlock);
        let transferred = match fault {
            Some((_, Some(partial))) => partial.min(buf.len()),
            Some((_, None)) => 0,
            None => buf.len(),
        };
        state
            .block_writes
            .entry(address)
            .or_default()
            .extend(buf[..transferred].iter().map(|word| word & width.mask()));
        state.calls.push(BusCall::WriteBlock {
            address,
            modifier,
            width,
            requested: buf.len(),
            transferred,
        });
        match fault {
            Some((fault, _)) => BlockOutcome::faulted(transferred, fault),
            None => BlockOutcome::complete(transferred),
        }
    }

    fn enable_irq(&mut self, mask: IrqMask) -> BackendResult<()> {
        let mut state = self.shared.state.lock();
        state.require_session()?;
        state.calls.push(BusCall::EnableIrq(mask));
        if let Some((fault, _)) = state.take_fault(Operation::EnableIrq) {
            return Err(fault);
        }
        state.enabled_irq |= mask;
        Ok(())
    }

    fn wait_irq(&mut self, mask: IrqMask, timeout: Duration) -> BackendResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        state.require_session()?;
        state.calls.push(BusCall::WaitIrq { mask, timeout });
        if let Some((fault, _)) = state.take_fault(Operation::WaitIrq) {
            return Err(fault);
        }
        loop {
            let fired = state.pending_irq & mask;
            if !fired.is_empty() {
                state.pending_irq.remove(fired);
                return Ok(());
            }
            if self.shared.irq.wait_until(&mut state, deadline).timed_out() {
                let fired = state.pending_irq & mask;
                if fired.is_empty() {
                    return Err(BusFault::Timeout);
                }
                state.pending_irq.remove(fired);
                return Ok(());
            }
        }
    }

    fn limits(&self) -> BackendLimits {
        self.shared.limits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{AddressingMode, TransferMode};
    use std::thread;

    fn am() -> AddressModifier {
        AddressModifier::single(AddressingMode::A32, TransferMode::D32).unwrap()
    }

    #[test]
    fn test_requires_open_session() {
        let mut bridge = SimulatedBackend::new();
        assert_eq!(
            bridge.read_single(0x10, am(), DataWidth::D32),
            Err(BusFault::Communication)
        );
        bridge.open(0, 0).unwrap();
        assert_eq!(bridge.read_single(0x10, am(), DataWidth::D32), Ok(0));
        assert_eq!(bridge.open(0, 0), Err(BusFault::InvalidParameter));
    }

    #[test]
    fn test_register_file_masks_width() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.write_single(0x20, am(), DataWidth::D16, 0x1_2345).unwrap();
        assert_eq!(bridge.register(0x20), Some(0x2345));
        assert_eq!(bridge.writes_to(0x20), vec![0x2345]);
    }

    #[test]
    fn test_queued_reads_before_register() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.set_register(0x30, 7);
        bridge.queue_reads(0x30, [1, 2]);
        let reads: Vec<_> = (0..3)
            .map(|_| bridge.read_single(0x30, am(), DataWidth::D32).unwrap())
            .collect();
        assert_eq!(reads, vec![1, 2, 7]);
    }

    #[test]
    fn test_block_read_drains_queue() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.queue_reads(0x40, 0..5);
        let mut buf = [0u64; 4];
        let outcome = bridge.read_block(0x40, am(), DataWidth::D32, &mut buf);
        assert_eq!(outcome, BlockOutcome::complete(4));
        let outcome = bridge.read_block(0x40, am(), DataWidth::D32, &mut buf);
        assert_eq!(outcome, BlockOutcome::complete(1));
        assert_eq!(buf[0], 4);
        assert_eq!(bridge.block_reads(), vec![(4, 4), (4, 1)]);
    }

    #[test]
    fn test_fault_scenarios() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.inject(FaultScenario::Once {
            operation: Operation::WriteSingle,
            fault: BusFault::Bus,
        });
        assert_eq!(
            bridge.write_single(0, am(), DataWidth::D32, 1),
            Err(BusFault::Bus)
        );
        assert!(bridge.write_single(0, am(), DataWidth::D32, 1).is_ok());

        bridge.inject(FaultScenario::FailAfterN {
            operation: Operation::ReadSingle,
            count: 2,
            fault: BusFault::Timeout,
        });
        assert!(bridge.read_single(0, am(), DataWidth::D32).is_ok());
        assert!(bridge.read_single(0, am(), DataWidth::D32).is_ok());
        assert_eq!(
            bridge.read_single(0, am(), DataWidth::D32),
            Err(BusFault::Timeout)
        );
    }

    #[test]
    fn test_partial_block_fault() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.queue_reads(0x40, 0..100);
        bridge.inject(FaultScenario::PartialBlock {
            operation: Operation::ReadBlock,
            transferred: 10,
            fault: BusFault::Bus,
        });
        let mut buf = [0u64; 64];
        let outcome = bridge.read_block(0x40, am(), DataWidth::D32, &mut buf);
        assert_eq!(outcome, BlockOutcome::faulted(10, BusFault::Bus));
    }

    #[test]
    fn test_write_hook_raises_irq() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.on_write(0x1700, |state, _| state.raise_irq(IrqMask::IRQ1));
        bridge.write_single(0x1700, am(), DataWidth::D32, 1).unwrap();
        assert!(bridge
            .wait_irq(IrqMask::IRQ1, Duration::from_millis(1))
            .is_ok());
        // consumed by the first wait
        assert_eq!(
            bridge.wait_irq(IrqMask::IRQ1, Duration::from_millis(1)),
            Err(BusFault::Timeout)
        );
    }

    #[test]
    fn test_read_hook_runs_after_value() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.set_register(0x2000, 1);
        bridge.on_read(0x2000, |state| {
            let next = state.register(0x2000).unwrap_or(0) + 1;
            state.set_register(0x2000, next);
        });
        assert_eq!(bridge.read_single(0x2000, am(), DataWidth::D32), Ok(1));
        assert_eq!(bridge.read_single(0x2000, am(), DataWidth::D32), Ok(2));
    }

    #[test]
    fn test_reset_state_from_hook() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.queue_reads(0x0D00, 0..4);
        bridge.raise_irq(IrqMask::IRQ1);
        bridge.on_write(0x0800, |state, _| {
            state.clear_reads(0x0D00);
            state.clear_irq(IrqMask::all());
        });
        bridge.write_single(0x0800, am(), DataWidth::D32, 1).unwrap();
        assert_eq!(bridge.with_state(|state| state.queued(0x0D00)), 0);
        assert_eq!(
            bridge.wait_irq(IrqMask::IRQ1, Duration::from_millis(1)),
            Err(BusFault::Timeout)
        );
    }

    #[test]
    fn test_irq_from_other_thread() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        let raiser = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            raiser.raise_irq(IrqMask::IRQ5);
        });
        let result = bridge.wait_irq(IrqMask::IRQ5, Duration::from_secs(5));
        handle.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_irq_other_level_does_not_wake() {
        let mut bridge = SimulatedBackend::new();
        bridge.open(0, 0).unwrap();
        bridge.raise_irq(IrqMask::IRQ2);
        assert_eq!(
            bridge.wait_irq(IrqMask::IRQ1, Duration::from_millis(5)),
            Err(BusFault::Timeout)
        );
    }
}
