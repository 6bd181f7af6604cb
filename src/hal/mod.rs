//! Host collaborator interfaces
//!
//! The device models never own virtual CPUs, timers or guest memory.
//! Those are provided by the hosting VMM through the traits below:
//! - [`Hart`] / [`HartRegistry`] for interrupt line delivery
//! - [`TimerQueue`] for one-shot deadline callbacks
//! - [`GuestMemory`] for MSI writes into guest physical memory

use alloc::sync::Arc;
use core::fmt;

use crate::Result;

/// Guest physical address
pub type PhysAddr = u64;

/// Hart identifier (`mhartid`)
pub type HartId = u32;

/// Per-hart interrupt lines driven by the AIA devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrqLine {
    /// Supervisor software interrupt (SSIP)
    SupervisorSoftware,
    /// Machine software interrupt (MSIP)
    MachineSoftware,
    /// Machine timer interrupt (MTIP)
    MachineTimer,
    /// Supervisor external interrupt (SEIP)
    SupervisorExternal,
    /// Machine external interrupt (MEIP)
    MachineExternal,
    /// Guest external interrupt for VS-level file `n` (hgeip bit `n`)
    GuestExternal(u8),
}

impl IrqLine {
    /// Bit position in `mip`/`hgeip`
    pub fn bit_position(self) -> u32 {
        match self {
            IrqLine::SupervisorSoftware => 1,
            IrqLine::MachineSoftware => 3,
            IrqLine::MachineTimer => 7,
            IrqLine::SupervisorExternal => 9,
            IrqLine::MachineExternal => 11,
            IrqLine::GuestExternal(n) => n as u32,
        }
    }
}

/// A virtual CPU as seen by the interrupt controllers
///
/// Implementations must be callable from any host thread; the IMSIC
/// raises lines from whichever hart performed the MSI store.
pub trait Hart: Send + Sync {
    /// The hart's `mhartid`
    fn hart_id(&self) -> HartId;

    /// Drive an interrupt line to the given level
    fn set_irq(&self, line: IrqLine, level: bool);

    /// Current architectural pending state of a line
    fn irq_pending(&self, line: IrqLine) -> bool;
}

/// Lookup of harts by `mhartid`, consumed at construction time
pub trait HartRegistry {
    /// Find a hart by its identifier
    fn hart(&self, hart_id: HartId) -> Option<Arc<dyn Hart>>;
}

impl HartRegistry for [Arc<dyn Hart>] {
    fn hart(&self, hart_id: HartId) -> Option<Arc<dyn Hart>> {
        self.iter().find(|h| h.hart_id() == hart_id).cloned()
    }
}

impl HartRegistry for alloc::vec::Vec<Arc<dyn Hart>> {
    fn hart(&self, hart_id: HartId) -> Option<Arc<dyn Hart>> {
        self.as_slice().hart(hart_id)
    }
}

/// A single level-sensitive output line into a hart
#[derive(Clone)]
pub struct IrqOutput {
    hart: Arc<dyn Hart>,
    line: IrqLine,
}

impl IrqOutput {
    /// Bind an output to a hart's input line
    pub fn new(hart: Arc<dyn Hart>, line: IrqLine) -> Self {
        Self { hart, line }
    }

    /// Resolve `hart_id` through a registry and bind `line`
    pub fn resolve<R: HartRegistry + ?Sized>(
        registry: &R,
        hart_id: HartId,
        line: IrqLine,
    ) -> Result<Self> {
        registry
            .hart(hart_id)
            .map(|hart| Self::new(hart, line))
            .ok_or(crate::Error::HartNotFound(hart_id))
    }

    /// Hart driven by this output
    pub fn hart_id(&self) -> HartId {
        self.hart.hart_id()
    }

    /// Line driven by this output
    pub fn line(&self) -> IrqLine {
        self.line
    }

    /// Drive the line
    pub fn set(&self, level: bool) {
        self.hart.set_irq(self.line, level);
    }

    /// Assert the line
    pub fn raise(&self) {
        self.set(true);
    }

    /// Deassert the line
    pub fn lower(&self) {
        self.set(false);
    }

    /// Read the hart's architectural pending bit for this line
    pub fn pending(&self) -> bool {
        self.hart.irq_pending(self.line)
    }
}

impl fmt::Debug for IrqOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqOutput")
            .field("hart", &self.hart.hart_id())
            .field("line", &self.line)
            .finish()
    }
}

/// Opaque identifier of a scheduled timer callback
pub type TimerToken = u32;

/// Host virtual clock with one-shot callbacks
///
/// `arm` replaces any deadline already pending for the same token.
/// When a deadline passes the host calls back into the owning device
/// (e.g. [`crate::emulator::aclint::Mtimer::expire`]) with the token.
pub trait TimerQueue: Send + Sync {
    /// Current virtual time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Schedule a callback for `token` at `deadline_ns`
    fn arm(&self, token: TimerToken, deadline_ns: u64);

    /// Cancel the pending callback for `token`, if any
    fn cancel(&self, token: TimerToken);
}

/// Guest physical memory as seen by a bus master
pub trait GuestMemory: Send + Sync {
    /// Store a little-endian 32-bit word
    fn write_u32(&self, addr: PhysAddr, value: u32) -> Result<()>;
}
