//! AIA platform assembly
//!
//! [`AiaPlatform`] owns every interrupt device of one VM, wires them up
//! from a [`PlatformConfig`] and dispatches guest MMIO by address range.
//!
//! MTIMER, the SWI blocks and the APLIC domain tree sit behind one lock.
//! IMSIC files stay outside of it: MSI stores reach them from any hart,
//! including the APLIC while it holds the lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::PlatformConfig;
use crate::emulator::aclint::{Mtimer, Swi};
use crate::emulator::aplic::{AplicSystem, DomainId};
use crate::emulator::imsic::Imsic;
use crate::emulator::{rejected_read_value, Emulator};
use crate::hal::{GuestMemory, HartId, HartRegistry, PhysAddr, TimerQueue, TimerToken};
use crate::{Error, Result};

/// Bus master view used by the APLIC for MSI writes
///
/// Stores that land in an IMSIC page are delivered to that file
/// directly; everything else is forwarded to host memory.
pub struct MsiRouter {
    files: Vec<Arc<Imsic>>,
    host: Arc<dyn GuestMemory>,
}

impl MsiRouter {
    pub fn new(files: Vec<Arc<Imsic>>, host: Arc<dyn GuestMemory>) -> Self {
        Self { files, host }
    }

    /// IMSIC file covering `addr`, with the offset into its aperture
    fn find(&self, addr: PhysAddr) -> Option<(&Arc<Imsic>, u64)> {
        self.files.iter().find_map(|file| {
            let base = file.config().base_address;
            (addr >= base && addr - base < file.aperture_size()).then(|| (file, addr - base))
        })
    }
}

impl GuestMemory for MsiRouter {
    fn write_u32(&self, addr: PhysAddr, value: u32) -> Result<()> {
        match self.find(addr) {
            Some((file, offset)) => file.mmio_write(offset, u64::from(value), 4),
            None => self.host.write_u32(addr, value),
        }
    }
}

/// Devices serialized by the platform lock
struct Devices {
    mtimer: Mtimer,
    mswi: Swi,
    sswi: Option<Swi>,
    aplic: AplicSystem,
    aplic_m: DomainId,
    aplic_s: Option<DomainId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Mtimer,
    Mswi,
    Sswi,
    Aplic(DomainId),
}

/// Interrupt subsystem of one VM
pub struct AiaPlatform {
    config: PlatformConfig,
    devices: Mutex<Devices>,
    imsic_m: Vec<Arc<Imsic>>,
    imsic_s: Vec<Arc<Imsic>>,
    router: Arc<MsiRouter>,
    /// Address ranges of the locked devices
    windows: Vec<(PhysAddr, u64, Target)>,
}

impl AiaPlatform {
    /// Build every device described by `config`
    ///
    /// Any inconsistency in the description is fatal and reported here.
    pub fn new<R: HartRegistry + ?Sized>(
        config: PlatformConfig,
        registry: &R,
        timer: Arc<dyn TimerQueue>,
        memory: Arc<dyn GuestMemory>,
    ) -> Result<Self> {
        config.validate()?;

        let (imsic_m, imsic_s) = match &config.imsic {
            Some(layout) => {
                let mut m = Vec::with_capacity(config.num_harts as usize);
                let mut s = Vec::with_capacity(config.num_harts as usize);
                for index in 0..config.num_harts {
                    let hartid = config.hartid_base + index;
                    m.push(Arc::new(Imsic::new(layout.file_config(hartid, index, true), registry)?));
                    s.push(Arc::new(Imsic::new(layout.file_config(hartid, index, false), registry)?));
                }
                (m, s)
            }
            None => (Vec::new(), Vec::new()),
        };

        let files = imsic_m.iter().chain(&imsic_s).cloned().collect();
        let router = Arc::new(MsiRouter::new(files, memory));

        let mtimer = Mtimer::new(config.mtimer.clone(), registry, timer)?;
        let mswi = Swi::new(config.mswi.clone(), registry)?;
        let sswi = config
            .sswi
            .clone()
            .map(|c| Swi::new(c, registry))
            .transpose()?;

        let mut aplic = AplicSystem::new(router.clone());
        let aplic_m = aplic.add_domain(config.aplic_m.clone(), None, registry)?;
        let aplic_s = config
            .aplic_s
            .clone()
            .map(|c| aplic.add_domain(c, Some(aplic_m), registry))
            .transpose()?;

        let mut windows = Vec::new();
        windows.push((config.mtimer.base_address, config.mtimer.aperture_size, Target::Mtimer));
        windows.push((config.mswi.base_address, crate::config::SwiConfig::APERTURE_SIZE, Target::Mswi));
        if let Some(sswi) = &config.sswi {
            windows.push((sswi.base_address, crate::config::SwiConfig::APERTURE_SIZE, Target::Sswi));
        }
        windows.push((config.aplic_m.base_address, config.aplic_m.aperture_size, Target::Aplic(aplic_m)));
        if let (Some(s), Some(id)) = (&config.aplic_s, aplic_s) {
            windows.push((s.base_address, s.aperture_size, Target::Aplic(id)));
        }

        log::info!(
            "AIA platform: {} harts from {}, APLIC {}, {} IMSIC files",
            config.num_harts,
            config.hartid_base,
            if config.aplic_m.msi_mode { "MSI" } else { "direct" },
            imsic_m.len() + imsic_s.len()
        );

        Ok(Self {
            config,
            devices: Mutex::new(Devices {
                mtimer,
                mswi,
                sswi,
                aplic,
                aplic_m,
                aplic_s,
            }),
            imsic_m,
            imsic_s,
            router,
            windows,
        })
    }

    /// Board description
    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// MSI bus master shared with the APLIC
    pub fn msi_router(&self) -> &Arc<MsiRouter> {
        &self.router
    }

    /// IMSIC file of `hartid` at the given level
    pub fn imsic(&self, hartid: HartId, machine_level: bool) -> Option<&Arc<Imsic>> {
        let index = hartid.checked_sub(self.config.hartid_base)? as usize;
        let files = if machine_level { &self.imsic_m } else { &self.imsic_s };
        files.get(index)
    }

    /// APLIC root and optional supervisor child
    pub fn aplic_domains(&self) -> (DomainId, Option<DomainId>) {
        let devices = self.devices.lock();
        (devices.aplic_m, devices.aplic_s)
    }

    /// Current `mtime`, for `rdtime`
    pub fn mtime(&self) -> u64 {
        self.devices.lock().mtimer.mtime()
    }

    /// Host timer callback
    pub fn timer_expired(&self, token: TimerToken) -> bool {
        self.devices.lock().mtimer.expire(token)
    }

    /// Drive wired input `source` of the root APLIC domain
    pub fn set_irq(&self, source: u32, level: bool) -> Result<()> {
        let mut devices = self.devices.lock();
        let root = devices.aplic_m;
        devices.aplic.set_irq(root, source, level)
    }

    /// Run `f` with exclusive access to the APLIC tree
    pub fn with_aplic<T>(&self, f: impl FnOnce(&mut AplicSystem) -> T) -> T {
        f(&mut self.devices.lock().aplic)
    }

    fn window(&self, addr: PhysAddr) -> Option<(Target, u64)> {
        self.windows
            .iter()
            .find(|(base, size, _)| addr >= *base && addr - *base < *size)
            .map(|(base, _, target)| (*target, addr - *base))
    }

    fn access<T>(
        &self,
        addr: PhysAddr,
        f: impl FnOnce(&mut dyn Emulator, u64) -> Result<T>,
    ) -> Result<T> {
        let Some((target, offset)) = self.window(addr) else {
            log::warn!("AIA platform: no device at {:#x}", addr);
            return Err(Error::InvalidOffset);
        };
        let mut devices = self.devices.lock();
        match target {
            Target::Mtimer => f(&mut devices.mtimer, offset),
            Target::Mswi => f(&mut devices.mswi, offset),
            Target::Sswi => match devices.sswi.as_mut() {
                Some(sswi) => f(sswi, offset),
                None => Err(Error::InvalidOffset),
            },
            Target::Aplic(id) => f(&mut devices.aplic.mmio(id)?, offset),
        }
    }

    /// Guest load; rejected accesses read all-ones
    pub fn mmio_read(&self, addr: PhysAddr, size: u32) -> u64 {
        let result = match self.router.find(addr) {
            Some((file, offset)) => file.mmio_read(offset, size),
            None => self.access(addr, |dev, offset| dev.read(offset, size)),
        };
        result.unwrap_or_else(|_| rejected_read_value(size))
    }

    /// Guest store; rejected accesses are dropped
    pub fn mmio_write(&self, addr: PhysAddr, value: u64, size: u32) {
        let result = match self.router.find(addr) {
            Some((file, offset)) => file.mmio_write(offset, value, size),
            None => self.access(addr, |dev, offset| dev.write(offset, value, size)),
        };
        if let Err(err) = result {
            log::trace!("AIA platform: dropped write to {:#x}: {}", addr, err);
        }
    }

    /// Reset every device
    pub fn reset(&self) {
        {
            let mut devices = self.devices.lock();
            devices.mtimer.reset();
            devices.mswi.reset();
            if let Some(sswi) = devices.sswi.as_mut() {
                sswi.reset();
            }
            devices.aplic.reset();
        }
        for file in self.imsic_m.iter().chain(&self.imsic_s) {
            file.reset_files();
        }
        log::debug!("AIA platform reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::aplic::regs::{aplic_regs::*, MSIADDRCFGH_LHXW_SHIFT, SOURCECFG_D};
    use crate::emulator::imsic::{iselect, IregKey};
    use crate::hal::IrqLine;
    use crate::testing::{harts, ManualTimer, RecordingHart, RecordingMemory};

    const APLIC_M: u64 = 0x0c00_0000;
    const APLIC_S: u64 = 0x0d00_0000;
    const SM_EDGE_RISE: u64 = 4;
    const SM_LEVEL_HIGH: u64 = 6;

    struct Board {
        platform: AiaPlatform,
        harts: Vec<Arc<RecordingHart>>,
        timer: Arc<ManualTimer>,
        memory: Arc<RecordingMemory>,
    }

    fn board(config: PlatformConfig) -> Board {
        let (recorders, registry) = harts(0, config.num_harts);
        let timer = ManualTimer::new();
        let memory = RecordingMemory::new();
        let platform = AiaPlatform::new(config, &registry, timer.clone(), memory.clone()).unwrap();
        Board {
            platform,
            harts: recorders,
            timer,
            memory,
        }
    }

    fn src(irq: u32) -> u64 {
        SOURCECFG_BASE + 4 * u64::from(irq - 1)
    }

    fn tgt(irq: u32) -> u64 {
        TARGET_BASE + 4 * u64::from(irq - 1)
    }

    #[test]
    fn test_msi_path_to_supervisor_file() {
        let b = board(PlatformConfig::aplic_imsic(2));
        let p = &b.platform;

        // Firmware: MSI layout, delegate source 1 to the S domain
        p.mmio_write(APLIC_M + MMSIADDRCFG, 0x24000, 4);
        p.mmio_write(APLIC_M + MMSIADDRCFGH, 1 << MSIADDRCFGH_LHXW_SHIFT, 4);
        p.mmio_write(APLIC_M + SMSIADDRCFG, 0x28000, 4);
        p.mmio_write(APLIC_M + SMSIADDRCFGH, 0, 4);
        p.mmio_write(APLIC_M + src(1), u64::from(SOURCECFG_D), 4);

        // Supervisor: route source 1 to hart 1, identity 9
        p.mmio_write(APLIC_S + DOMAINCFG, 0x100, 4);
        p.mmio_write(APLIC_S + src(1), SM_EDGE_RISE, 4);
        p.mmio_write(APLIC_S + tgt(1), (1 << 18) | 9, 4);
        p.mmio_write(APLIC_S + SETIENUM, 1, 4);

        let file = p.imsic(1, false).unwrap();
        file.rmw(IregKey::supervisor(iselect::EIDELIVERY, 64), 1, 1).unwrap();
        file.rmw(IregKey::supervisor(iselect::EIE0, 64), 1 << 9, 1 << 9).unwrap();

        p.set_irq(1, true).unwrap();
        assert!(b.harts[1].level(IrqLine::SupervisorExternal));
        assert!(!b.harts[0].level(IrqLine::SupervisorExternal));
        assert!(b.memory.take().is_empty());

        assert_eq!(file.claim(0), Some(9));
        assert!(!b.harts[1].level(IrqLine::SupervisorExternal));
    }

    #[test]
    fn test_msi_outside_imsic_goes_to_memory() {
        let b = board(PlatformConfig::aplic_imsic(1));
        let p = &b.platform;
        p.mmio_write(APLIC_M + MMSIADDRCFG, 0x80000, 4);
        p.mmio_write(APLIC_M + DOMAINCFG, 0x100, 4);
        p.mmio_write(APLIC_M + src(3), SM_EDGE_RISE, 4);
        p.mmio_write(APLIC_M + tgt(3), 4, 4);
        p.mmio_write(APLIC_M + SETIENUM, 3, 4);

        p.set_irq(3, true).unwrap();
        assert_eq!(b.memory.take(), [(0x8000_0000, 4)]);
    }

    #[test]
    fn test_guest_store_to_imsic() {
        let b = board(PlatformConfig::aplic_imsic(2));
        let p = &b.platform;
        let file = p.imsic(0, true).unwrap();
        file.rmw(IregKey::machine(iselect::EIDELIVERY, 64), 1, 1).unwrap();
        file.rmw(IregKey::machine(iselect::EIE0, 64), 1 << 3, 1 << 3).unwrap();

        p.mmio_write(0x2400_0000, 3, 4);
        assert!(b.harts[0].level(IrqLine::MachineExternal));
        assert_eq!(p.mmio_read(0x2400_0000, 4), 0);
        assert!(p.imsic(1, true).unwrap().topei(0).is_none());
    }

    #[test]
    fn test_wired_path() {
        let b = board(PlatformConfig::aplic_wired(1));
        let p = &b.platform;
        let idc = APLIC_M + IDC_BASE;

        p.mmio_write(APLIC_M + DOMAINCFG, 0x100, 4);
        p.mmio_write(APLIC_M + src(2), SM_LEVEL_HIGH, 4);
        p.mmio_write(APLIC_M + tgt(2), 1, 4);
        p.mmio_write(APLIC_M + SETIENUM, 2, 4);
        p.mmio_write(idc + IDELIVERY, 1, 4);

        p.set_irq(2, true).unwrap();
        assert!(b.harts[0].level(IrqLine::MachineExternal));
        assert_eq!(p.mmio_read(idc + TOPI, 4), (2 << 16) | 1);

        // Input still asserted: claim re-latches pending
        assert_eq!(p.mmio_read(idc + CLAIMI, 4), (2 << 16) | 1);
        assert!(b.harts[0].level(IrqLine::MachineExternal));

        p.set_irq(2, false).unwrap();
        assert!(!b.harts[0].level(IrqLine::MachineExternal));
        assert_eq!(p.mmio_read(idc + CLAIMI, 4), 0);
    }

    #[test]
    fn test_timer_and_software_interrupts() {
        let b = board(PlatformConfig::aplic_imsic(2));
        let p = &b.platform;

        p.mmio_write(0x0200_4000 + 8, 100, 8);
        assert_eq!(b.timer.deadline(1), Some(10_000));
        assert!(!b.harts[1].level(IrqLine::MachineTimer));

        for token in b.timer.advance_to(10_000) {
            assert!(p.timer_expired(token));
        }
        assert!(b.harts[1].level(IrqLine::MachineTimer));
        assert_eq!(p.mtime(), 100);

        p.mmio_write(0x0200_0004, 1, 4);
        assert!(b.harts[1].level(IrqLine::MachineSoftware));
        assert_eq!(p.mmio_read(0x0200_0004, 4), 1);

        p.mmio_write(0x02f0_0000, 1, 4);
        assert!(b.harts[0].level(IrqLine::SupervisorSoftware));
    }

    #[test]
    fn test_rejected_accesses() {
        let b = board(PlatformConfig::aplic_imsic(1));
        let p = &b.platform;
        assert_eq!(p.mmio_read(0x1000_0000, 4), 0xffff_ffff);
        assert_eq!(p.mmio_read(0x0200_4002, 4), 0xffff_ffff);
        assert_eq!(p.mmio_read(APLIC_M + DOMAINCFG, 8), u64::MAX);
        // Dropped without effect
        p.mmio_write(0x1000_0000, 1, 4);
        p.mmio_write(0x2400_0008, 1, 4);
        assert!(b.memory.take().is_empty());
    }

    #[test]
    fn test_reset() {
        let b = board(PlatformConfig::aplic_imsic(1));
        let p = &b.platform;
        p.mmio_write(0x0200_0000, 1, 4);
        p.mmio_write(APLIC_M + DOMAINCFG, 0x100, 4);
        let file = p.imsic(0, true).unwrap();
        file.rmw(IregKey::machine(iselect::EIDELIVERY, 64), 1, 1).unwrap();
        b.timer.set_now(1_000);
        assert_eq!(p.mtime(), 10);

        p.reset();
        assert!(!b.harts[0].level(IrqLine::MachineSoftware));
        assert_eq!(p.mmio_read(APLIC_M + DOMAINCFG, 4) & 0x100, 0);
        assert_eq!(file.rmw(IregKey::machine(iselect::EIDELIVERY, 64), 0, 0), Ok(0));
        assert_eq!(p.mtime(), 0);
    }

    #[test]
    fn test_invalid_config_fatal() {
        let (_recorders, registry) = harts(0, 1);
        let mut config = PlatformConfig::aplic_imsic(2);
        config.imsic = None;
        let result = AiaPlatform::new(config, &registry, ManualTimer::new(), RecordingMemory::new());
        assert!(matches!(result, Err(Error::InvalidConfig)));

        let result = AiaPlatform::new(
            PlatformConfig::aplic_imsic(2),
            &registry,
            ManualTimer::new(),
            RecordingMemory::new(),
        );
        assert!(matches!(result, Err(Error::HartNotFound(1))));
    }
}
