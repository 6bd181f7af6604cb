//! RISC-V APLIC (Advanced Platform-Level Interrupt Controller) emulation
//!
//! The APLIC is modeled as an arena of interrupt domains. Domains refer
//! to their parent and children by [`DomainId`], so the delegation tree
//! has no back-pointers and can be snapshotted directly.
//!
//! Each domain delivers either over wired lines (one external interrupt
//! line per IDC, arbitrated by priority) or by MSI writes into guest
//! memory, normally landing in an IMSIC interrupt file.

pub mod domain;
pub mod msi;
pub mod regs;

use alloc::sync::Arc;
use alloc::vec::Vec;

pub use domain::{AplicDomain, AplicDomainSnapshot, MAX_CHILDREN};
pub use msi::MsiAddrCfg;
pub use regs::{Register, SourceCfg, SourceMode};

use crate::config::AplicConfig;
use crate::emulator::{check_access, unmapped, Emulator};
use crate::hal::{GuestMemory, HartRegistry, IrqLine, IrqOutput};
use crate::{Error, Result};
use regs::*;

/// Handle of a domain inside an [`AplicSystem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DomainId(usize);

impl DomainId {
    /// Position in the arena
    pub fn index(self) -> usize {
        self.0
    }
}

/// All APLIC domains of a machine
pub struct AplicSystem {
    domains: Vec<AplicDomain>,
    memory: Arc<dyn GuestMemory>,
}

impl AplicSystem {
    /// Create an empty arena; MSI writes go to `memory`
    pub fn new(memory: Arc<dyn GuestMemory>) -> Self {
        Self {
            domains: Vec::new(),
            memory,
        }
    }

    /// Add a domain under `parent`, or a root domain when `parent` is `None`
    ///
    /// Roots must be machine-level. A child must have as many sources as
    /// its parent and a supervisor-level domain cannot have a
    /// machine-level child.
    pub fn add_domain<R: HartRegistry + ?Sized>(
        &mut self,
        config: AplicConfig,
        parent: Option<DomainId>,
        registry: &R,
    ) -> Result<DomainId> {
        config.validate()?;

        match parent {
            Some(p) => {
                let pd = self.domains.get(p.0).ok_or(Error::DomainNotFound)?;
                if pd.num_sources() != config.num_sources {
                    log::error!(
                        "APLIC: child has {} sources, parent {}",
                        config.num_sources,
                        pd.num_sources()
                    );
                    return Err(Error::SourceCountMismatch);
                }
                if !pd.machine_level() && config.machine_level {
                    log::error!("APLIC: machine-level domain under a supervisor-level parent");
                    return Err(Error::InvalidConfig);
                }
                if pd.children.is_full() {
                    log::error!("APLIC: more than {} children", MAX_CHILDREN);
                    return Err(Error::TooManyChildren);
                }
            }
            None if !config.machine_level => {
                log::error!("APLIC: root domain must be machine-level");
                return Err(Error::InvalidConfig);
            }
            None => {}
        }

        let outputs = if config.msi_mode {
            Vec::new()
        } else {
            let line = if config.machine_level {
                IrqLine::MachineExternal
            } else {
                IrqLine::SupervisorExternal
            };
            (0..config.num_harts)
                .map(|i| IrqOutput::resolve(registry, config.hartid_base + i, line))
                .collect::<Result<Vec<_>>>()?
        };

        let id = DomainId(self.domains.len());
        if let Some(p) = parent {
            self.domains[p.0]
                .children
                .push(id)
                .map_err(|_| Error::TooManyChildren)?;
        }

        log::info!(
            "APLIC {} at {:#x}: {} sources, {} harts from {}, {} delivery",
            if config.machine_level { "M" } else { "S" },
            config.base_address,
            config.num_sources,
            config.num_harts,
            config.hartid_base,
            if config.msi_mode { "MSI" } else { "direct" }
        );
        self.domains.push(AplicDomain::new(config, parent, outputs));
        Ok(id)
    }

    /// Look up a domain
    pub fn domain(&self, id: DomainId) -> Result<&AplicDomain> {
        self.domains.get(id.0).ok_or(Error::DomainNotFound)
    }

    fn domain_mut(&mut self, id: DomainId) -> Result<&mut AplicDomain> {
        self.domains.get_mut(id.0).ok_or(Error::DomainNotFound)
    }

    /// All domain handles in creation order
    pub fn ids(&self) -> impl Iterator<Item = DomainId> {
        (0..self.domains.len()).map(DomainId)
    }

    pub fn parent(&self, id: DomainId) -> Option<DomainId> {
        self.domains.get(id.0).and_then(AplicDomain::parent)
    }

    pub fn children(&self, id: DomainId) -> &[DomainId] {
        self.domains.get(id.0).map_or(&[][..], |d| d.children())
    }

    /// Root of the tree containing `id`
    pub fn root(&self, id: DomainId) -> DomainId {
        let mut cur = id;
        while let Some(parent) = self.parent(cur) {
            cur = parent;
        }
        cur
    }

    /// Drive wired input `irq` of domain `id`
    ///
    /// Delegated sources are forwarded down the tree; every domain on
    /// the way records the input level.
    pub fn set_irq(&mut self, id: DomainId, irq: u32, level: bool) -> Result<()> {
        if !self.domain(id)?.valid_source(irq) {
            log::warn!("APLIC: input for invalid source {}", irq);
            return Err(Error::InvalidArgument);
        }

        let mut cur = id;
        while let Some(child) = self.domains[cur.0].delegated_child(irq) {
            self.domains[cur.0].record_input(irq, level);
            cur = child;
        }

        if self.domains[cur.0].gateway(irq, level) {
            self.update_source(cur, irq);
        }
        Ok(())
    }

    /// A child's `sourcecfg[irq]` is writable only while delegated to it
    fn source_accessible(&self, id: DomainId, irq: u32) -> bool {
        match self.domains[id.0].parent() {
            None => true,
            Some(p) => self.domains[p.0].delegated_child(irq) == Some(id),
        }
    }

    /// MSI address registers live in the root domain only; the
    /// supervisor pair needs a supervisor-level child
    fn msi_regs_implemented(&self, id: DomainId, supervisor: bool) -> bool {
        let d = &self.domains[id.0];
        d.parent().is_none()
            && (!supervisor
                || d
                    .children()
                    .iter()
                    .any(|c| !self.domains[c.0].machine_level()))
    }

    fn write_sourcecfg(&mut self, id: DomainId, irq: u32, value: u32) {
        let name = self.domains[id.0].name();
        if !self.source_accessible(id, irq) {
            log::warn!("{}: sourcecfg[{}] is not delegated to this domain", name, irq);
            return;
        }

        let d = &self.domains[id.0];
        let new = if value & SOURCECFG_D != 0 {
            let child = value & SOURCECFG_CHILDIDX_MASK;
            if (child as usize) < d.children().len() {
                SourceCfg::Delegated(child)
            } else {
                log::warn!("{}: sourcecfg[{}] names missing child {}", name, irq, child);
                SourceCfg::Local(SourceMode::Inactive)
            }
        } else {
            match SourceMode::from_bits(value) {
                Some(mode) => SourceCfg::Local(mode),
                None => {
                    log::warn!("{}: sourcecfg[{}] reserved mode {:#x}", name, irq, value);
                    SourceCfg::Local(SourceMode::Inactive)
                }
            }
        };

        let old_child = d.delegated_child(irq);
        if d.source(irq) != new {
            if let Some(child) = old_child {
                log::debug!("{}: withdrawing source {} from {:?}", name, irq, child);
                self.deactivate(child, irq);
            }
        }

        let input = self.domains[id.0].input_level(irq);
        self.domains[id.0].store_sourcecfg(irq, new);
        if let Some(child) = self.domains[id.0].delegated_child(irq) {
            log::debug!("{}: source {} delegated to {:?}", name, irq, child);
            self.domains[child.0].record_input(irq, input);
        }
    }

    /// Make `irq` inactive in `id` and everything below it
    fn deactivate(&mut self, id: DomainId, irq: u32) {
        if let Some(child) = self.domains[id.0].delegated_child(irq) {
            self.deactivate(child, irq);
        }
        self.domains[id.0].store_sourcecfg(irq, SourceCfg::Local(SourceMode::Inactive));
        self.update_all(id);
    }

    /// Propagate a pending change of `irq` to its delivery target
    fn update_source(&mut self, id: DomainId, irq: u32) {
        let d = &mut self.domains[id.0];
        if d.msi_mode() {
            if d.take_msi(irq) {
                let (hart, guest, eiid) = d.msi_target(irq);
                self.msi_send(id, hart, guest, eiid);
            }
        } else {
            d.idc_update(d.wired_hart(irq));
        }
    }

    /// Re-evaluate every source (MSI mode) or IDC (direct mode)
    fn update_all(&mut self, id: DomainId) {
        let d = &self.domains[id.0];
        if d.msi_mode() {
            for irq in 1..=d.num_sources() {
                self.update_source(id, irq);
            }
        } else {
            for idc in 0..d.num_idcs() {
                d.idc_update(idc);
            }
        }
    }

    /// MSI address configuration seen by domain `id`
    pub fn msi_addr_cfg(&self, id: DomainId) -> Result<MsiAddrCfg> {
        let d = self.domain(id)?;
        let root = &self.domains[self.root(id).0];
        Ok(if d.machine_level() {
            MsiAddrCfg::from_regs(root.mmsiaddrcfg, root.mmsiaddrcfgh, root.mmsiaddrcfgh)
        } else {
            MsiAddrCfg::from_regs(root.smsiaddrcfg, root.smsiaddrcfgh, root.mmsiaddrcfgh)
        })
    }

    fn msi_send(&self, id: DomainId, hart: u32, guest: u32, eiid: u32) {
        let d = &self.domains[id.0];
        let Ok(cfg) = self.msi_addr_cfg(id) else {
            return;
        };
        let guest = if d.machine_level() { 0 } else { guest };
        let addr = cfg.address(hart, guest);

        log::debug!(
            "{}: MSI hart {} guest {} eiid {} -> {:#x}",
            d.name(),
            hart,
            guest,
            eiid,
            addr
        );
        if let Err(err) = self.memory.write_u32(addr, eiid) {
            log::warn!("{}: MSI to {:#x} lost: {}", d.name(), addr, err);
        }
    }

    /// Current wired winner for `idc` as `(source, priority)`
    pub fn topi(&self, id: DomainId, idc: u32) -> Result<Option<(u32, u32)>> {
        let d = self.domain(id)?;
        if idc >= d.num_idcs() {
            return Err(Error::InvalidArgument);
        }
        Ok(d.topi(idc))
    }

    /// Claim the wired winner for `idc`
    pub fn claim(&mut self, id: DomainId, idc: u32) -> Result<Option<(u32, u32)>> {
        let d = self.domain_mut(id)?;
        if idc >= d.num_idcs() {
            return Err(Error::InvalidArgument);
        }
        let claimed = d.claim(idc);
        d.idc_update(idc);
        log::trace!("{}: idc {} claimed {:?}", d.name(), idc, claimed);
        Ok(claimed)
    }

    /// Register read on domain `id`
    pub fn read(&mut self, id: DomainId, offset: u64, size: u32) -> Result<u64> {
        let d = self.domain(id)?;
        let name = d.name();
        check_access(name, offset, size, &[4])?;
        let reg = Register::decode(offset, d.num_sources(), d.msi_mode(), d.num_idcs())
            .ok_or_else(|| unmapped(name, offset, None))?;

        let value = match reg {
            Register::DomainCfg => d.read_domaincfg(),
            Register::SourceCfg(irq) => {
                if self.source_accessible(id, irq) {
                    d.sourcecfg(irq)
                } else {
                    0
                }
            }
            Register::MmsiAddrCfg | Register::MmsiAddrCfgH
                if !self.msi_regs_implemented(id, false) =>
            {
                return Err(unmapped(name, offset, None))
            }
            Register::SmsiAddrCfg | Register::SmsiAddrCfgH
                if !self.msi_regs_implemented(id, true) =>
            {
                return Err(unmapped(name, offset, None))
            }
            Register::MmsiAddrCfg => d.mmsiaddrcfg,
            Register::MmsiAddrCfgH => d.mmsiaddrcfgh,
            Register::SmsiAddrCfg => d.smsiaddrcfg,
            Register::SmsiAddrCfgH => d.smsiaddrcfgh,
            Register::SetIp(word) => d.read_word(word, AplicDomain::is_pending),
            Register::InClrIp(word) => d.read_word(word, AplicDomain::rectified_input),
            Register::SetIe(word) => d.read_word(word, AplicDomain::is_enabled),
            Register::ClrIe(_)
            | Register::SetIpNum
            | Register::ClrIpNum
            | Register::SetIeNum
            | Register::ClrIeNum
            | Register::SetIpNumLe
            | Register::SetIpNumBe => 0,
            Register::GenMsi => d.genmsi,
            Register::Target(irq) => d.target(irq),
            Register::Idc(idc, aplic_regs::TOPI) => d.topi_value(idc),
            Register::Idc(idc, aplic_regs::CLAIMI) => {
                let top = d.topi_value(idc);
                self.claim(id, idc)?;
                top
            }
            Register::Idc(idc, reg) => d
                .idc_reg(idc, reg)
                .ok_or_else(|| unmapped(name, offset, None))?,
        };

        log::trace!("{}: read {:#x} = {:#x}", name, offset, value);
        Ok(u64::from(value))
    }

    /// Register write on domain `id`
    pub fn write(&mut self, id: DomainId, offset: u64, value: u64, size: u32) -> Result<()> {
        let d = self.domain(id)?;
        let name = d.name();
        check_access(name, offset, size, &[4])?;
        let reg = Register::decode(offset, d.num_sources(), d.msi_mode(), d.num_idcs())
            .ok_or_else(|| unmapped(name, offset, Some(value)))?;
        let value = value as u32;
        log::trace!("{}: write {:#x} = {:#x}", name, offset, value);

        let locked = self.domains[self.root(id).0].mmsiaddrcfgh & MSIADDRCFGH_L != 0;
        match reg {
            Register::MmsiAddrCfg
            | Register::MmsiAddrCfgH
            | Register::SmsiAddrCfg
            | Register::SmsiAddrCfgH => {
                let supervisor = matches!(reg, Register::SmsiAddrCfg | Register::SmsiAddrCfgH);
                if !self.msi_regs_implemented(id, supervisor) {
                    return Err(unmapped(name, offset, Some(u64::from(value))));
                }
                if locked {
                    log::debug!("{}: MSI address registers locked", name);
                    return Ok(());
                }
                let d = &mut self.domains[id.0];
                match reg {
                    Register::MmsiAddrCfg => d.mmsiaddrcfg = value,
                    Register::MmsiAddrCfgH => d.mmsiaddrcfgh = value & MMSIADDRCFGH_VALID,
                    Register::SmsiAddrCfg => d.smsiaddrcfg = value,
                    _ => d.smsiaddrcfgh = value & SMSIADDRCFGH_VALID,
                }
            }
            Register::SourceCfg(irq) => self.write_sourcecfg(id, irq, value),
            Register::GenMsi => {
                let d = &mut self.domains[id.0];
                d.genmsi = value & ((TARGET_HART_IDX_MASK << TARGET_HART_IDX_SHIFT) | TARGET_EIID_MASK);
                let hart = (value >> TARGET_HART_IDX_SHIFT) & TARGET_HART_IDX_MASK;
                self.msi_send(id, hart, 0, value & TARGET_EIID_MASK);
            }
            Register::Idc(idc, reg) => {
                if !self.domains[id.0].write_idc_reg(idc, reg, value) {
                    return Err(unmapped(name, offset, Some(u64::from(value))));
                }
            }
            reg => {
                let d = &mut self.domains[id.0];
                match reg {
                    Register::DomainCfg => d.write_domaincfg(value),
                    Register::SetIp(word) => d.write_word(word, value, |d, irq| d.set_pending(irq, true)),
                    Register::SetIpNum | Register::SetIpNumLe => d.set_pending(value, true),
                    Register::SetIpNumBe => d.set_pending(value.swap_bytes(), true),
                    Register::InClrIp(word) => {
                        d.write_word(word, value, |d, irq| d.set_pending(irq, false))
                    }
                    Register::ClrIpNum => d.set_pending(value, false),
                    Register::SetIe(word) => d.write_word(word, value, |d, irq| d.set_enabled(irq, true)),
                    Register::SetIeNum => d.set_enabled(value, true),
                    Register::ClrIe(word) => {
                        d.write_word(word, value, |d, irq| d.set_enabled(irq, false))
                    }
                    Register::ClrIeNum => d.set_enabled(value, false),
                    Register::Target(irq) => d.write_target(irq, value),
                    _ => {}
                }
            }
        }

        self.update_all(id);
        Ok(())
    }

    /// Reset one domain
    pub fn reset_domain(&mut self, id: DomainId) -> Result<()> {
        self.domain_mut(id)?.reset();
        self.update_all(id);
        Ok(())
    }

    /// Reset every domain
    pub fn reset(&mut self) {
        for id in 0..self.domains.len() {
            self.domains[id].reset();
            self.update_all(DomainId(id));
        }
    }

    /// Capture the state of domain `id`
    pub fn snapshot(&self, id: DomainId) -> Result<AplicDomainSnapshot> {
        Ok(self.domain(id)?.snapshot())
    }

    /// Restore the state of domain `id` and re-drive its outputs
    pub fn restore(&mut self, id: DomainId, snapshot: &AplicDomainSnapshot) -> Result<()> {
        if !self.domain_mut(id)?.restore(snapshot) {
            return Err(Error::InvalidArgument);
        }
        self.update_all(id);
        Ok(())
    }

    /// MMIO view of domain `id`
    pub fn mmio(&mut self, id: DomainId) -> Result<DomainMmio<'_>> {
        self.domain(id)?;
        Ok(DomainMmio { system: self, id })
    }
}

/// [`Emulator`] adapter for a single APLIC domain
pub struct DomainMmio<'a> {
    system: &'a mut AplicSystem,
    id: DomainId,
}

impl Emulator for DomainMmio<'_> {
    fn name(&self) -> &str {
        self.system.domains[self.id.0].name()
    }

    fn aperture_size(&self) -> u64 {
        self.system.domains[self.id.0].config().aperture_size
    }

    fn read(&mut self, offset: u64, size: u32) -> Result<u64> {
        self.system.read(self.id, offset, size)
    }

    fn write(&mut self, offset: u64, value: u64, size: u32) -> Result<()> {
        self.system.write(self.id, offset, value, size)
    }

    fn reset(&mut self) {
        self.system.domains[self.id.0].reset();
        self.system.update_all(self.id);
    }
}
