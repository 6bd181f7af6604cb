//! Host fakes shared by the unit tests

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::hal::{GuestMemory, Hart, HartId, IrqLine, PhysAddr, TimerQueue, TimerToken};
use crate::{Error, Result};

/// Hart that records the level of every line it is driven with
pub struct RecordingHart {
    id: HartId,
    lines: Mutex<BTreeMap<u32, LineState>>,
}

#[derive(Default, Clone, Copy)]
struct LineState {
    level: bool,
    rising_edges: u32,
}

fn line_key(line: IrqLine) -> u32 {
    match line {
        IrqLine::GuestExternal(n) => 0x100 + u32::from(n),
        other => other.bit_position(),
    }
}

impl RecordingHart {
    pub fn new(id: HartId) -> Arc<Self> {
        Arc::new(Self {
            id,
            lines: Mutex::new(BTreeMap::new()),
        })
    }

    /// Current level of `line`
    pub fn level(&self, line: IrqLine) -> bool {
        self.lines
            .lock()
            .get(&line_key(line))
            .map_or(false, |s| s.level)
    }

    /// Number of low-to-high transitions seen on `line`
    pub fn rising_edges(&self, line: IrqLine) -> u32 {
        self.lines
            .lock()
            .get(&line_key(line))
            .map_or(0, |s| s.rising_edges)
    }

    /// Set the architectural pending bit without going through a device
    pub fn force(&self, line: IrqLine, level: bool) {
        self.lines.lock().entry(line_key(line)).or_default().level = level;
    }
}

impl Hart for RecordingHart {
    fn hart_id(&self) -> HartId {
        self.id
    }

    fn set_irq(&self, line: IrqLine, level: bool) {
        let mut lines = self.lines.lock();
        let state = lines.entry(line_key(line)).or_default();
        if level && !state.level {
            state.rising_edges += 1;
        }
        state.level = level;
    }

    fn irq_pending(&self, line: IrqLine) -> bool {
        self.level(line)
    }
}

/// Build `count` harts numbered from `base`
pub fn harts(base: HartId, count: u32) -> (Vec<Arc<RecordingHart>>, Vec<Arc<dyn Hart>>) {
    let recorders: Vec<Arc<RecordingHart>> =
        (0..count).map(|i| RecordingHart::new(base + i)).collect();
    let registry = recorders
        .iter()
        .map(|h| h.clone() as Arc<dyn Hart>)
        .collect();
    (recorders, registry)
}

/// Virtual clock advanced by hand
#[derive(Default)]
pub struct ManualTimer {
    now: AtomicU64,
    armed: Mutex<BTreeMap<TimerToken, u64>>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_now(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    /// Move the clock forward and return the tokens whose deadline passed
    pub fn advance_to(&self, ns: u64) -> Vec<TimerToken> {
        self.set_now(ns);
        let mut armed = self.armed.lock();
        let due: Vec<TimerToken> = armed
            .iter()
            .filter(|(_, deadline)| **deadline <= ns)
            .map(|(token, _)| *token)
            .collect();
        for token in &due {
            armed.remove(token);
        }
        due
    }

    pub fn deadline(&self, token: TimerToken) -> Option<u64> {
        self.armed.lock().get(&token).copied()
    }

    pub fn pending(&self) -> usize {
        self.armed.lock().len()
    }
}

impl TimerQueue for ManualTimer {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn arm(&self, token: TimerToken, deadline_ns: u64) {
        self.armed.lock().insert(token, deadline_ns);
    }

    fn cancel(&self, token: TimerToken) {
        self.armed.lock().remove(&token);
    }
}

/// Guest memory that records MSI stores
#[derive(Default)]
pub struct RecordingMemory {
    writes: Mutex<Vec<(PhysAddr, u32)>>,
    reject: Mutex<Option<PhysAddr>>,
}

impl RecordingMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make stores to `addr` fail
    pub fn reject(&self, addr: PhysAddr) {
        *self.reject.lock() = Some(addr);
    }

    pub fn take(&self) -> Vec<(PhysAddr, u32)> {
        core::mem::take(&mut *self.writes.lock())
    }
}

impl GuestMemory for RecordingMemory {
    fn write_u32(&self, addr: PhysAddr, value: u32) -> Result<()> {
        if *self.reject.lock() == Some(addr) {
            return Err(Error::MemoryFault(addr));
        }
        self.writes.lock().push((addr, value));
        Ok(())
    }
}
