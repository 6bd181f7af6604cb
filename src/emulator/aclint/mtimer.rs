//! ACLINT MTIMER device
//!
//! `mtime` is derived from the host virtual clock:
//! `mtime = ticks(now_ns) + time_delta` (wrapping), so writing `mtime`
//! only moves the delta. Each hart owns one compare register and at most
//! one armed [`TimerQueue`] callback, keyed by the hart index.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::Access;
use crate::config::MtimerConfig;
use crate::emulator::{check_access, unmapped, Emulator};
use crate::hal::{HartRegistry, IrqLine, IrqOutput, TimerQueue, TimerToken};
use crate::{Error, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Convert host nanoseconds to timer ticks (rounded down)
fn ns_to_ticks(ns: u64, freq: u64) -> u64 {
    let ticks = u128::from(ns) * u128::from(freq) / NANOS_PER_SEC;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// Convert a tick count to host nanoseconds (rounded up, saturating)
fn ticks_to_ns(ticks: u64, freq: u64) -> u64 {
    let freq = u128::from(freq);
    let ns = (u128::from(ticks) * NANOS_PER_SEC + freq - 1) / freq;
    u64::try_from(ns).unwrap_or(u64::MAX)
}

/// Serializable MTIMER state
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MtimerSnapshot {
    /// Offset added to the raw tick counter
    pub time_delta: u64,
    /// Per-hart compare values
    pub timecmp: Vec<u64>,
}

/// MTIMER emulator
pub struct Mtimer {
    config: MtimerConfig,
    timer: Arc<dyn TimerQueue>,
    outputs: Vec<IrqOutput>,
    timecmp: Vec<u64>,
    /// Armed deadline per hart, in host nanoseconds
    scheduled: Vec<Option<u64>>,
    time_delta: u64,
}

impl Mtimer {
    /// Create an MTIMER for `config.num_harts` harts
    pub fn new<R: HartRegistry + ?Sized>(
        config: MtimerConfig,
        registry: &R,
        timer: Arc<dyn TimerQueue>,
    ) -> Result<Self> {
        config.validate()?;

        let outputs = (0..config.num_harts)
            .map(|i| IrqOutput::resolve(registry, config.hartid_base + i, IrqLine::MachineTimer))
            .collect::<Result<Vec<_>>>()?;
        let num_harts = config.num_harts as usize;

        log::info!(
            "MTIMER at {:#x}: {} harts from {}, {} Hz",
            config.base_address,
            config.num_harts,
            config.hartid_base,
            config.timebase_freq
        );

        Ok(Self {
            config,
            timer,
            outputs,
            timecmp: alloc::vec![u64::MAX; num_harts],
            scheduled: alloc::vec![None; num_harts],
            time_delta: 0,
        })
    }

    /// Device configuration
    pub fn config(&self) -> &MtimerConfig {
        &self.config
    }

    fn raw_ticks(&self) -> u64 {
        ns_to_ticks(self.timer.now_ns(), self.config.timebase_freq)
    }

    /// Current `mtime` value, as seen by `rdtime`
    pub fn mtime(&self) -> u64 {
        self.raw_ticks().wrapping_add(self.time_delta)
    }

    /// Read the shared `mtime` register
    pub fn read_time(&self, access: Access) -> u64 {
        access.extract(self.mtime())
    }

    /// Write the shared `mtime` register and re-evaluate every hart
    pub fn write_time(&mut self, value: u64, access: Access) {
        let raw = self.raw_ticks();
        let current = raw.wrapping_add(self.time_delta);
        let new_time = access.merge(current, value);
        self.time_delta = new_time.wrapping_sub(raw);
        log::trace!("MTIMER: mtime <- {:#x}", new_time);

        for index in 0..self.timecmp.len() {
            self.update(index);
        }
    }

    /// Read hart `index`'s compare register
    pub fn read_compare(&self, index: u32, access: Access) -> Result<u64> {
        self.timecmp
            .get(index as usize)
            .map(|&cmp| access.extract(cmp))
            .ok_or(Error::InvalidArgument)
    }

    /// Write hart `index`'s compare register
    pub fn write_compare(&mut self, index: u32, value: u64, access: Access) -> Result<()> {
        let slot = self
            .timecmp
            .get_mut(index as usize)
            .ok_or(Error::InvalidArgument)?;
        *slot = access.merge(*slot, value);
        log::trace!("MTIMER: mtimecmp[{}] <- {:#x}", index, *slot);
        self.update(index as usize);
        Ok(())
    }

    /// Deadline currently armed for hart `index`
    pub fn scheduled_deadline(&self, index: u32) -> Option<u64> {
        self.scheduled.get(index as usize).copied().flatten()
    }

    /// Timer callback for `token`
    ///
    /// Returns `false` for tokens this device never armed.
    pub fn expire(&mut self, token: TimerToken) -> bool {
        let index = token as usize;
        match self.scheduled.get_mut(index) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                self.update(index);
                true
            }
            _ => false,
        }
    }

    /// Compare hart `index` against `mtime` and drive its line
    fn update(&mut self, index: usize) {
        let mtime = self.mtime();
        let cmp = self.timecmp[index];
        let token = index as TimerToken;

        if mtime >= cmp {
            self.outputs[index].raise();
            if self.scheduled[index].take().is_some() {
                self.timer.cancel(token);
            }
            return;
        }

        self.outputs[index].lower();
        let delay = ticks_to_ns(cmp - mtime, self.config.timebase_freq);
        let deadline = self.timer.now_ns().saturating_add(delay);
        // `arm` replaces the previous callback for this token.
        self.timer.arm(token, deadline);
        self.scheduled[index] = Some(deadline);
    }

    /// Capture the device state
    pub fn snapshot(&self) -> MtimerSnapshot {
        MtimerSnapshot {
            time_delta: self.time_delta,
            timecmp: self.timecmp.clone(),
        }
    }

    /// Restore a previously captured state
    pub fn restore(&mut self, snapshot: &MtimerSnapshot) -> Result<()> {
        if snapshot.timecmp.len() != self.timecmp.len() {
            return Err(Error::InvalidArgument);
        }
        self.time_delta = snapshot.time_delta;
        self.timecmp.copy_from_slice(&snapshot.timecmp);
        for index in 0..self.timecmp.len() {
            self.update(index);
        }
        Ok(())
    }

    fn compare_index(&self, offset: u64) -> Option<u32> {
        let rel = offset.checked_sub(self.config.timecmp_base)?;
        let index = rel / 8;
        (index < u64::from(self.config.num_harts)).then_some(index as u32)
    }

    fn is_time(&self, offset: u64) -> bool {
        offset & !0x7 == self.config.time_base
    }
}

impl Emulator for Mtimer {
    fn name(&self) -> &str {
        "aclint-mtimer"
    }

    fn aperture_size(&self) -> u64 {
        self.config.aperture_size
    }

    fn read(&mut self, offset: u64, size: u32) -> Result<u64> {
        check_access(self.name(), offset, size, &[4, 8])?;
        let access = Access::from_mmio(offset, size);

        if self.is_time(offset) {
            return Ok(self.read_time(access));
        }
        match self.compare_index(offset) {
            Some(index) => self.read_compare(index, access),
            None => Err(unmapped(self.name(), offset, None)),
        }
    }

    fn write(&mut self, offset: u64, value: u64, size: u32) -> Result<()> {
        check_access(self.name(), offset, size, &[4, 8])?;
        let access = Access::from_mmio(offset, size);

        if self.is_time(offset) {
            self.write_time(value, access);
            return Ok(());
        }
        match self.compare_index(offset) {
            Some(index) => self.write_compare(index, value, access),
            None => Err(unmapped(self.name(), offset, Some(value))),
        }
    }

    /// Clear `mtime`; compare registers keep their values
    fn reset(&mut self) {
        self.write_time(0, Access::Full);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harts, ManualTimer};

    const FREQ: u64 = 10_000_000;

    fn setup(num_harts: u32) -> (Mtimer, Vec<Arc<crate::testing::RecordingHart>>, Arc<ManualTimer>) {
        let (recorders, registry) = harts(0, num_harts);
        let timer = ManualTimer::new();
        let config = MtimerConfig {
            num_harts,
            timebase_freq: FREQ,
            ..MtimerConfig::default()
        };
        let mtimer = Mtimer::new(config, &registry, timer.clone()).unwrap();
        (mtimer, recorders, timer)
    }

    #[test]
    fn test_tick_conversion() {
        assert_eq!(ns_to_ticks(1_000, FREQ), 10);
        assert_eq!(ns_to_ticks(1_099, FREQ), 10);
        assert_eq!(ticks_to_ns(100, FREQ), 10_000);
        // Rounds up so the callback never fires early
        assert_eq!(ticks_to_ns(1, 3), 333_333_334);
        assert_eq!(ticks_to_ns(u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_initial_state() {
        let (mtimer, recorders, timer) = setup(2);
        assert_eq!(mtimer.read_compare(1, Access::Full), Ok(u64::MAX));
        assert_eq!(mtimer.mtime(), 0);
        assert!(!recorders[0].level(IrqLine::MachineTimer));
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_compare_scenario() {
        let (mut mtimer, recorders, timer) = setup(1);
        timer.set_now(10_000); // tick 100
        assert_eq!(mtimer.mtime(), 100);

        mtimer.write_compare(0, 50, Access::Full).unwrap();
        assert!(recorders[0].level(IrqLine::MachineTimer));
        assert_eq!(timer.pending(), 0);
        assert_eq!(mtimer.scheduled_deadline(0), None);

        mtimer.write_compare(0, 200, Access::Full).unwrap();
        assert!(!recorders[0].level(IrqLine::MachineTimer));
        assert_eq!(timer.deadline(0), Some(20_000));
        assert_eq!(mtimer.scheduled_deadline(0), Some(20_000));

        assert!(timer.advance_to(19_999).is_empty());
        assert!(!recorders[0].level(IrqLine::MachineTimer));

        let due = timer.advance_to(20_000);
        assert_eq!(due, [0]);
        let edges = recorders[0].rising_edges(IrqLine::MachineTimer);
        for token in due {
            assert!(mtimer.expire(token));
        }
        assert!(recorders[0].level(IrqLine::MachineTimer));
        assert_eq!(recorders[0].rising_edges(IrqLine::MachineTimer), edges + 1);
        assert_eq!(timer.pending(), 0);
        // One-shot
        assert!(!mtimer.expire(0));
    }

    #[test]
    fn test_rewrite_replaces_callback() {
        let (mut mtimer, _recorders, timer) = setup(1);
        mtimer.write_compare(0, 1_000, Access::Full).unwrap();
        mtimer.write_compare(0, 2_000, Access::Full).unwrap();
        assert_eq!(timer.pending(), 1);
        assert_eq!(timer.deadline(0), Some(200_000));
    }

    #[test]
    fn test_half_compare_writes() {
        let (mut mtimer, _recorders, _timer) = setup(1);
        mtimer.write_compare(0, 0x1234, Access::Low).unwrap();
        assert_eq!(mtimer.read_compare(0, Access::Full), Ok(0xffff_ffff_0000_1234));
        mtimer.write_compare(0, 0, Access::High).unwrap();
        assert_eq!(mtimer.read_compare(0, Access::Full), Ok(0x1234));
    }

    #[test]
    fn test_write_time_reevaluates() {
        let (mut mtimer, recorders, timer) = setup(2);
        mtimer.write_compare(0, 500, Access::Full).unwrap();
        mtimer.write_compare(1, 5_000, Access::Full).unwrap();
        assert!(!recorders[0].level(IrqLine::MachineTimer));

        mtimer.write_time(1_000, Access::Full);
        assert_eq!(mtimer.mtime(), 1_000);
        assert!(recorders[0].level(IrqLine::MachineTimer));
        assert!(!recorders[1].level(IrqLine::MachineTimer));
        assert_eq!(timer.deadline(0), None);
        assert_eq!(timer.deadline(1), Some(400_000));

        timer.set_now(50_000);
        assert_eq!(mtimer.mtime(), 1_500);
    }

    #[test]
    fn test_far_compare_saturates() {
        let (recorders, registry) = harts(0, 1);
        let timer = ManualTimer::new();
        let config = MtimerConfig {
            timebase_freq: 1,
            ..MtimerConfig::default()
        };
        let mut mtimer = Mtimer::new(config, &registry, timer.clone()).unwrap();
        timer.set_now(5);
        mtimer.write_compare(0, u64::MAX - 1, Access::Full).unwrap();
        assert_eq!(timer.deadline(0), Some(u64::MAX));
        assert!(!recorders[0].level(IrqLine::MachineTimer));
    }

    #[test]
    fn test_mmio_layout() {
        let (mut mtimer, _recorders, timer) = setup(2);
        timer.set_now(100_000);
        assert_eq!(mtimer.read(0x7ff8, 8), Ok(1_000));
        assert_eq!(mtimer.read(0x7ffc, 4), Ok(0));

        mtimer.write(0x8, 0x40, 4).unwrap();
        assert_eq!(mtimer.read_compare(1, Access::Low), Ok(0x40));
        assert_eq!(mtimer.read(0xc, 4), Ok(0xffff_ffff));

        assert_eq!(mtimer.read(0x10, 8), Err(Error::InvalidOffset));
        assert_eq!(mtimer.read(0x2, 4), Err(Error::InvalidAccess));
        assert_eq!(mtimer.write(0x0, 1, 2), Err(Error::InvalidAccess));
    }

    #[test]
    fn test_reset_clears_pending() {
        let (mut mtimer, recorders, timer) = setup(1);
        timer.set_now(10_000);
        mtimer.write_compare(0, 50, Access::Full).unwrap();
        assert!(recorders[0].level(IrqLine::MachineTimer));

        mtimer.reset();
        assert_eq!(mtimer.mtime(), 0);
        assert!(!recorders[0].level(IrqLine::MachineTimer));
        assert_eq!(timer.deadline(0), Some(15_000));
    }

    #[test]
    fn test_snapshot_restore() {
        let (mut mtimer, _recorders, _timer) = setup(2);
        mtimer.write_time(42, Access::Full);
        mtimer.write_compare(1, 100, Access::Full).unwrap();
        let snapshot = mtimer.snapshot();

        let (mut other, recorders, timer) = setup(2);
        other.restore(&snapshot).unwrap();
        assert_eq!(other.read_compare(1, Access::Full), Ok(100));
        assert_eq!(other.mtime(), 42);
        assert!(!recorders[1].level(IrqLine::MachineTimer));
        assert_eq!(timer.deadline(1), Some(5_800));

        let bad = MtimerSnapshot {
            time_delta: 0,
            timecmp: alloc::vec![0],
        };
        assert_eq!(other.restore(&bad), Err(Error::InvalidArgument));
    }
}
