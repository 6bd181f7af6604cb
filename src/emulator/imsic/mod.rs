//! RISC-V IMSIC (Incoming MSI Controller) emulation
//!
//! One [`Imsic`] models the interrupt files of one hart at one privilege
//! level. Guest stores into a file page set identities pending; the
//! owning hart drives the rest of the file through the indirect CSR
//! window (`miselect`/`mireg`, `siselect`/`sireg`, `vsiselect`/`vsireg`)
//! and the `*topei` CSRs, modeled here by [`Imsic::rmw`].
//!
//! The device is shared (`&self`) on every path: MSI writes arrive from
//! whichever hart performed the store.

pub mod file;

use alloc::vec::Vec;

pub use file::InterruptFile;

use crate::config::{ImsicConfig, IMSIC_PAGE_SIZE};
use crate::emulator::{check_access, Emulator};
use crate::hal::{HartRegistry, IrqLine, IrqOutput};
use crate::{Error, Result};
use file::{EISTATE_ENABLED, EISTATE_PENDING};

/// Indirect register selectors
pub mod iselect {
    pub const EIDELIVERY: u32 = 0x70;
    pub const EITHRESHOLD: u32 = 0x72;
    pub const EIP0: u32 = 0x80;
    pub const EIP63: u32 = 0xbf;
    pub const EIE0: u32 = 0xc0;
    pub const EIE63: u32 = 0xff;
    /// Pseudo-selector for the `*topei` CSRs
    pub const TOPEI: u32 = 0x200;
}

/// `seteipnum_le` offset within a file page
pub const SETEIPNUM_LE: u64 = 0x0;
/// `seteipnum_be` offset within a file page
pub const SETEIPNUM_BE: u64 = 0x4;

const TOPEI_IID_SHIFT: u32 = 16;

/// Privilege level of an indirect CSR access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Supervisor,
    Machine,
}

/// Key of an indirect CSR access issued by the owning hart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IregKey {
    pub privilege: Privilege,
    /// Access comes from VS-mode (`vsiselect`/`vstopei`)
    pub virt: bool,
    pub isel: u32,
    /// `hstatus.VGEIN` for virtualized accesses
    pub vgein: u32,
    /// Register width in bits, 32 or 64
    pub xlen: u32,
}

impl IregKey {
    /// Machine-level access
    pub fn machine(isel: u32, xlen: u32) -> Self {
        Self {
            privilege: Privilege::Machine,
            virt: false,
            isel,
            vgein: 0,
            xlen,
        }
    }

    /// Supervisor-level access to the host file
    pub fn supervisor(isel: u32, xlen: u32) -> Self {
        Self {
            privilege: Privilege::Supervisor,
            ..Self::machine(isel, xlen)
        }
    }

    /// VS-level access to guest file `vgein`
    pub fn guest(isel: u32, vgein: u32, xlen: u32) -> Self {
        Self {
            virt: true,
            vgein,
            ..Self::supervisor(isel, xlen)
        }
    }
}

/// Serializable IMSIC state
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImsicSnapshot {
    /// Per page
    pub eidelivery: Vec<u32>,
    /// Per page
    pub eithreshold: Vec<u32>,
    /// Page-major, `num_ids + 1` entries per page
    pub eistate: Vec<u32>,
}

/// IMSIC emulator for one hart and privilege level
pub struct Imsic {
    config: ImsicConfig,
    pages: Vec<InterruptFile>,
}

impl Imsic {
    /// Create the interrupt files for `config.hartid`
    pub fn new<R: HartRegistry + ?Sized>(config: ImsicConfig, registry: &R) -> Result<Self> {
        config.validate()?;

        let pages = (0..config.num_pages())
            .map(|page| {
                let line = match (config.machine_level, page) {
                    (true, _) => IrqLine::MachineExternal,
                    (false, 0) => IrqLine::SupervisorExternal,
                    (false, g) => IrqLine::GuestExternal(g as u8),
                };
                IrqOutput::resolve(registry, config.hartid, line)
                    .map(|output| InterruptFile::new(output, config.num_ids))
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "IMSIC {} for hart {} at {:#x}: {} ids, {} guests",
            if config.machine_level { "M" } else { "S" },
            config.hartid,
            config.base_address,
            config.num_ids,
            config.num_guests
        );

        Ok(Self { config, pages })
    }

    /// Device configuration
    pub fn config(&self) -> &ImsicConfig {
        &self.config
    }

    /// Owning hart
    pub fn hartid(&self) -> u32 {
        self.config.hartid
    }

    /// Interrupt file `page`
    pub fn file(&self, page: u32) -> Option<&InterruptFile> {
        self.pages.get(page as usize)
    }

    /// Deliver identity `eiid` to file `page`, as an MSI store would
    ///
    /// Zero and out-of-range identities are dropped.
    pub fn send(&self, page: u32, eiid: u32) {
        let Some(file) = self.file(page) else {
            log::warn!("IMSIC hart {}: MSI to missing page {}", self.hartid(), page);
            return;
        };
        if file.set_pending(eiid) {
            log::trace!("IMSIC hart {}: page {} eiid {}", self.hartid(), page, eiid);
            file.update();
        }
    }

    /// Guest store into the file aperture
    pub fn mmio_write(&self, offset: u64, value: u64, size: u32) -> Result<()> {
        check_access("imsic", offset, size, &[4])?;
        let page = offset / IMSIC_PAGE_SIZE;
        if page >= u64::from(self.config.num_pages()) {
            return Err(crate::emulator::unmapped("imsic", offset, Some(value)));
        }
        let eiid = match offset % IMSIC_PAGE_SIZE {
            SETEIPNUM_LE => value as u32,
            SETEIPNUM_BE => (value as u32).swap_bytes(),
            _ => return Err(crate::emulator::unmapped("imsic", offset, Some(value))),
        };
        self.send(page as u32, eiid);
        Ok(())
    }

    /// Guest load from the file aperture; every register reads zero
    pub fn mmio_read(&self, offset: u64, size: u32) -> Result<u64> {
        check_access("imsic", offset, size, &[4])?;
        if offset >= self.config.aperture_size() {
            return Err(crate::emulator::unmapped("imsic", offset, None));
        }
        Ok(0)
    }

    /// Page selected by an indirect access, if the key is legal here
    fn page_for(&self, key: &IregKey) -> Option<u32> {
        match (self.config.machine_level, key.privilege, key.virt) {
            (true, Privilege::Machine, false) => Some(0),
            (false, Privilege::Supervisor, false) => Some(0),
            (false, Privilege::Supervisor, true)
                if key.vgein != 0 && key.vgein < self.config.num_pages() =>
            {
                Some(key.vgein)
            }
            _ => None,
        }
    }

    /// Read-modify-write of an indirect register
    ///
    /// Returns the value before the write. Bits outside `wr_mask` are
    /// left untouched; a zero mask is a pure read.
    pub fn rmw(&self, key: IregKey, new_val: u64, wr_mask: u64) -> Result<u64> {
        let Some(page) = self.page_for(&key) else {
            log::warn!("IMSIC hart {}: invalid access {:?}", self.hartid(), key);
            return Err(Error::InvalidAccess);
        };
        let file = &self.pages[page as usize];

        let old = match key.isel {
            iselect::EIDELIVERY => u64::from(file.rmw_eidelivery(new_val as u32, wr_mask as u32)),
            iselect::EITHRESHOLD => {
                u64::from(file.rmw_eithreshold(new_val as u32, wr_mask as u32))
            }
            iselect::TOPEI => {
                let top = file.topei();
                if let (Some(id), true) = (top, wr_mask != 0) {
                    file.update_state(id, EISTATE_PENDING, false);
                }
                top.map_or(0, |id| u64::from((id << TOPEI_IID_SHIFT) | id))
            }
            isel @ iselect::EIP0..=iselect::EIP63 => {
                eix_rmw(file, key.xlen, isel - iselect::EIP0, EISTATE_PENDING, new_val, wr_mask)?
            }
            isel @ iselect::EIE0..=iselect::EIE63 => {
                eix_rmw(file, key.xlen, isel - iselect::EIE0, EISTATE_ENABLED, new_val, wr_mask)?
            }
            isel => {
                log::warn!("IMSIC hart {}: unknown iselect {:#x}", self.hartid(), isel);
                return Err(Error::InvalidArgument);
            }
        };

        file.update();
        Ok(old)
    }

    /// Deliverable identity for `page`, without claiming it
    pub fn topei(&self, page: u32) -> Option<u32> {
        self.file(page)?.topei()
    }

    /// Claim the top identity of `page`, as a `*topei` write does
    pub fn claim(&self, page: u32) -> Option<u32> {
        let file = self.file(page)?;
        let id = file.topei()?;
        file.update_state(id, EISTATE_PENDING, false);
        file.update();
        Some(id)
    }

    /// Whether identity `id` of `page` is pending
    pub fn is_pending(&self, page: u32, id: u32) -> bool {
        self.file(page)
            .map_or(false, |f| f.state(id) & EISTATE_PENDING != 0)
    }

    /// Clear every file
    pub fn reset_files(&self) {
        for file in &self.pages {
            file.reset();
        }
    }

    /// Capture the state of every file
    pub fn snapshot(&self) -> ImsicSnapshot {
        ImsicSnapshot {
            eidelivery: self.pages.iter().map(InterruptFile::eidelivery).collect(),
            eithreshold: self.pages.iter().map(InterruptFile::eithreshold).collect(),
            eistate: self
                .pages
                .iter()
                .flat_map(|f| (0..f.slots()).map(move |id| f.state(id)))
                .collect(),
        }
    }

    /// Restore a previously captured state
    pub fn restore(&self, snapshot: &ImsicSnapshot) -> Result<()> {
        let pages = self.pages.len();
        let slots = self.config.num_ids as usize + 1;
        if snapshot.eidelivery.len() != pages
            || snapshot.eithreshold.len() != pages
            || snapshot.eistate.len() != pages * slots
        {
            return Err(Error::InvalidArgument);
        }
        for (i, file) in self.pages.iter().enumerate() {
            file.store_raw(
                snapshot.eidelivery[i],
                snapshot.eithreshold[i],
                &snapshot.eistate[i * slots..(i + 1) * slots],
            );
        }
        Ok(())
    }
}

/// `eipN`/`eieN` access: 32 identities per register on XLEN 32, 64 on
/// XLEN 64 where only even `N` are valid
fn eix_rmw(
    file: &InterruptFile,
    xlen: u32,
    num: u32,
    bit: u32,
    new_val: u64,
    wr_mask: u64,
) -> Result<u64> {
    let num = match xlen {
        32 => num,
        64 if num % 2 == 0 => num / 2,
        _ => return Err(Error::InvalidArgument),
    };
    if num >= file.slots() / xlen {
        return Err(Error::InvalidArgument);
    }

    let base = num * xlen;
    let mut old = 0u64;
    for i in 0..xlen {
        // Bit 0 of eip0/eie0 is read-only zero
        if base + i == 0 {
            continue;
        }
        let mask = 1u64 << i;
        let prev = if wr_mask & mask != 0 {
            file.update_state(base + i, bit, new_val & mask != 0)
        } else {
            file.state(base + i)
        };
        if prev & bit != 0 {
            old |= mask;
        }
    }
    Ok(old)
}

impl Emulator for Imsic {
    fn name(&self) -> &str {
        if self.config.machine_level {
            "imsic-m"
        } else {
            "imsic-s"
        }
    }

    fn aperture_size(&self) -> u64 {
        self.config.aperture_size()
    }

    fn read(&mut self, offset: u64, size: u32) -> Result<u64> {
        self.mmio_read(offset, size)
    }

    fn write(&mut self, offset: u64, value: u64, size: u32) -> Result<()> {
        self.mmio_write(offset, value, size)
    }

    fn reset(&mut self) {
        self.reset_files();
    }
}
