//! Per-domain APLIC state
//!
//! Everything here is local to one domain: gateway, pending/enable
//! bookkeeping, wired arbitration and IDC line updates. Operations that
//! cross domains (delegation forwarding, MSI address lookup) live in
//! [`super::AplicSystem`].

use alloc::vec::Vec;

use super::regs::*;
use super::DomainId;
use crate::config::AplicConfig;
use crate::hal::IrqOutput;

/// Maximum number of child domains per domain
pub const MAX_CHILDREN: usize = 16;

/// Serializable state of one APLIC domain
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AplicDomainSnapshot {
    pub domaincfg: u32,
    pub mmsiaddrcfg: u32,
    pub mmsiaddrcfgh: u32,
    pub smsiaddrcfg: u32,
    pub smsiaddrcfgh: u32,
    pub genmsi: u32,
    /// Indexed by source number; entry 0 is unused
    pub sourcecfg: Vec<u32>,
    /// Indexed by source number; entry 0 is unused
    pub state: Vec<u32>,
    /// Indexed by source number; entry 0 is unused
    pub target: Vec<u32>,
    pub idelivery: Vec<u32>,
    pub iforce: Vec<u32>,
    pub ithreshold: Vec<u32>,
}

/// One APLIC interrupt domain
pub struct AplicDomain {
    pub(super) config: AplicConfig,
    pub(super) parent: Option<DomainId>,
    pub(super) children: heapless::Vec<DomainId, MAX_CHILDREN>,
    /// One external interrupt line per IDC (wired mode only)
    outputs: Vec<IrqOutput>,
    iprio_mask: u32,

    pub(super) domaincfg: DomainCfg,
    pub(super) mmsiaddrcfg: u32,
    pub(super) mmsiaddrcfgh: u32,
    pub(super) smsiaddrcfg: u32,
    pub(super) smsiaddrcfgh: u32,
    pub(super) genmsi: u32,

    sourcecfg: Vec<u32>,
    state: Vec<SourceState>,
    target: Vec<u32>,

    idelivery: Vec<u32>,
    iforce: Vec<u32>,
    ithreshold: Vec<u32>,
}

impl AplicDomain {
    pub(super) fn new(config: AplicConfig, parent: Option<DomainId>, outputs: Vec<IrqOutput>) -> Self {
        let sources = config.num_sources as usize + 1;
        let idcs = if config.msi_mode { 0 } else { config.num_harts as usize };
        let iprio_mask = (1u32 << config.iprio_bits) - 1;

        Self {
            config,
            parent,
            children: heapless::Vec::new(),
            outputs,
            iprio_mask,
            domaincfg: DomainCfg::empty(),
            mmsiaddrcfg: 0,
            mmsiaddrcfgh: 0,
            smsiaddrcfg: 0,
            smsiaddrcfgh: 0,
            genmsi: 0,
            sourcecfg: alloc::vec![0; sources],
            state: alloc::vec![SourceState::empty(); sources],
            target: alloc::vec![0; sources],
            idelivery: alloc::vec![0; idcs],
            iforce: alloc::vec![0; idcs],
            ithreshold: alloc::vec![0; idcs],
        }
    }

    /// Domain configuration
    pub fn config(&self) -> &AplicConfig {
        &self.config
    }

    /// Parent domain, `None` for the root
    pub fn parent(&self) -> Option<DomainId> {
        self.parent
    }

    /// Child domains in index order
    pub fn children(&self) -> &[DomainId] {
        &self.children
    }

    /// Name used in diagnostics
    pub fn name(&self) -> &'static str {
        if self.config.machine_level {
            "aplic-m"
        } else {
            "aplic-s"
        }
    }

    pub fn msi_mode(&self) -> bool {
        self.config.msi_mode
    }

    pub fn machine_level(&self) -> bool {
        self.config.machine_level
    }

    pub fn num_sources(&self) -> u32 {
        self.config.num_sources
    }

    pub(super) fn num_idcs(&self) -> u32 {
        self.idelivery.len() as u32
    }

    /// Whether `irq` names an implemented source
    pub fn valid_source(&self, irq: u32) -> bool {
        irq != 0 && irq <= self.config.num_sources
    }

    /// Domain-wide interrupt enable
    pub fn enabled(&self) -> bool {
        self.domaincfg.contains(DomainCfg::IE)
    }

    /// Value read back from `domaincfg`
    pub fn read_domaincfg(&self) -> u32 {
        let mut cfg = self.domaincfg | DomainCfg::RDONLY;
        if self.config.msi_mode {
            cfg |= DomainCfg::DM;
        }
        cfg.bits()
    }

    pub(super) fn write_domaincfg(&mut self, value: u32) {
        // Only IE is writable; DM and BE are fixed by configuration.
        self.domaincfg = DomainCfg::from_bits_truncate(value) & DomainCfg::IE;
    }

    /// Raw `sourcecfg[irq]`
    pub fn sourcecfg(&self, irq: u32) -> u32 {
        self.sourcecfg.get(irq as usize).copied().unwrap_or(0)
    }

    pub(super) fn source(&self, irq: u32) -> SourceCfg {
        SourceCfg::decode(self.sourcecfg(irq))
    }

    /// Gateway mode of `irq` in this domain; `None` when delegated
    pub(super) fn mode(&self, irq: u32) -> Option<SourceMode> {
        self.source(irq).mode()
    }

    /// Source is neither inactive nor delegated
    pub fn is_active(&self, irq: u32) -> bool {
        matches!(self.mode(irq), Some(mode) if mode != SourceMode::Inactive)
    }

    /// Child index `irq` is delegated to
    pub(super) fn delegated_child(&self, irq: u32) -> Option<DomainId> {
        match self.source(irq) {
            SourceCfg::Delegated(index) => self.children.get(index as usize).copied(),
            SourceCfg::Local(_) => None,
        }
    }

    /// Store a sourcecfg value already validated by the caller
    ///
    /// A mode change re-derives pending: level modes latch the rectified
    /// input, edge and detached modes start clear.
    pub(super) fn store_sourcecfg(&mut self, irq: u32, cfg: SourceCfg) {
        let irq_idx = irq as usize;
        let changed = self.source(irq) != cfg;
        self.sourcecfg[irq_idx] = cfg.encode();

        match cfg {
            SourceCfg::Delegated(_) | SourceCfg::Local(SourceMode::Inactive) => {
                self.state[irq_idx].remove(SourceState::ENPEND);
                self.target[irq_idx] = 0;
            }
            SourceCfg::Local(mode) if changed => {
                let pending = mode.is_level() && self.rectified_input(irq);
                self.state[irq_idx].set(SourceState::PENDING, pending);
            }
            SourceCfg::Local(_) => {}
        }
    }

    pub fn is_pending(&self, irq: u32) -> bool {
        self.state
            .get(irq as usize)
            .map_or(false, |s| s.contains(SourceState::PENDING))
    }

    pub fn is_enabled(&self, irq: u32) -> bool {
        self.state
            .get(irq as usize)
            .map_or(false, |s| s.contains(SourceState::ENABLED))
    }

    fn set_pending_raw(&mut self, irq: u32, pending: bool) {
        self.state[irq as usize].set(SourceState::PENDING, pending);
    }

    /// Raw input wire level of `irq`
    pub fn input_level(&self, irq: u32) -> bool {
        self.state
            .get(irq as usize)
            .map_or(false, |s| s.contains(SourceState::INPUT))
    }

    /// Record the raw input level without running the gateway
    pub(super) fn record_input(&mut self, irq: u32, level: bool) {
        self.state[irq as usize].set(SourceState::INPUT, level);
    }

    /// Input after polarity inversion; zero for inactive/detached sources
    pub fn rectified_input(&self, irq: u32) -> bool {
        match self.mode(irq) {
            None | Some(SourceMode::Inactive) | Some(SourceMode::Detached) => false,
            Some(mode) => {
                self.state[irq as usize].contains(SourceState::INPUT) != mode.is_inverted()
            }
        }
    }

    /// Run the gateway for a wire transition on a local source
    ///
    /// Returns `true` when the pending bit changed.
    pub(super) fn gateway(&mut self, irq: u32, level: bool) -> bool {
        let state = self.state[irq as usize];
        let was_input = state.contains(SourceState::INPUT);
        let pending = state.contains(SourceState::PENDING);

        let update = match self.mode(irq) {
            Some(SourceMode::EdgeRise) => level && !was_input && !pending,
            Some(SourceMode::EdgeFall) => !level && was_input && !pending,
            Some(mode @ (SourceMode::LevelHigh | SourceMode::LevelLow)) => {
                let asserted = level != mode.is_inverted();
                let was_asserted = was_input != mode.is_inverted();
                if self.config.msi_mode {
                    if !asserted && pending {
                        // A deasserted level source never stays pending.
                        self.set_pending_raw(irq, false);
                        self.record_input(irq, level);
                        return true;
                    }
                    asserted && !was_asserted && !pending
                } else if asserted != pending {
                    // Direct mode: pending follows the rectified input.
                    self.set_pending_raw(irq, asserted);
                    self.record_input(irq, level);
                    return true;
                } else {
                    false
                }
            }
            _ => false,
        };

        if update {
            self.set_pending_raw(irq, true);
        }
        self.record_input(irq, level);
        update
    }

    /// Software pending write (`setip*`/`clrip*`)
    pub(super) fn set_pending(&mut self, irq: u32, pending: bool) {
        if !self.valid_source(irq) {
            return;
        }
        let mode = match self.mode(irq) {
            Some(SourceMode::Inactive) | None => return,
            Some(mode) => mode,
        };
        if mode.is_level() && pending {
            if !self.config.msi_mode || !self.rectified_input(irq) {
                return;
            }
        } else if mode.is_level() && !self.config.msi_mode {
            return;
        }
        self.set_pending_raw(irq, pending);
    }

    /// Enable write (`setie*`/`clrie*`)
    pub(super) fn set_enabled(&mut self, irq: u32, enabled: bool) {
        if self.is_active(irq) {
            self.state[irq as usize].set(SourceState::ENABLED, enabled);
        }
    }

    /// Bits of a 32-source window, `f` evaluated per source
    pub(super) fn read_word(&self, word: u32, f: impl Fn(&Self, u32) -> bool) -> u32 {
        (0..32)
            .filter(|bit| {
                let irq = word * 32 + bit;
                self.valid_source(irq) && f(self, irq)
            })
            .fold(0, |acc, bit| acc | (1 << bit))
    }

    /// Apply `f` to every source named by a set bit of `value`
    pub(super) fn write_word(&mut self, word: u32, value: u32, f: impl Fn(&mut Self, u32)) {
        for bit in 0..32 {
            if value & (1 << bit) != 0 {
                f(self, word * 32 + bit);
            }
        }
    }

    /// Raw `target[irq]`
    pub fn target(&self, irq: u32) -> u32 {
        self.target.get(irq as usize).copied().unwrap_or(0)
    }

    pub(super) fn write_target(&mut self, irq: u32, value: u32) {
        if !self.is_active(irq) {
            return;
        }
        let hart = value & (TARGET_HART_IDX_MASK << TARGET_HART_IDX_SHIFT);
        let stored = if self.config.msi_mode {
            // Machine-level files have no guest index.
            let guest = if self.config.machine_level {
                0
            } else {
                value & (TARGET_GUEST_IDX_MASK << TARGET_GUEST_IDX_SHIFT)
            };
            hart | guest | (value & TARGET_EIID_MASK)
        } else {
            let prio = match value & self.iprio_mask {
                0 => 1,
                prio => prio,
            };
            hart | prio
        };
        self.target[irq as usize] = stored;
    }

    /// Decode an MSI target into (hart, guest, eiid)
    pub(super) fn msi_target(&self, irq: u32) -> (u32, u32, u32) {
        let target = self.target(irq);
        (
            (target >> TARGET_HART_IDX_SHIFT) & TARGET_HART_IDX_MASK,
            (target >> TARGET_GUEST_IDX_SHIFT) & TARGET_GUEST_IDX_MASK,
            target & TARGET_EIID_MASK,
        )
    }

    /// Hart index of a wired target
    pub(super) fn wired_hart(&self, irq: u32) -> u32 {
        (self.target(irq) >> TARGET_HART_IDX_SHIFT) & TARGET_HART_IDX_MASK
    }

    /// Pending and enabled under an enabled domain: ready for an MSI
    pub(super) fn take_msi(&mut self, irq: u32) -> bool {
        if !self.config.msi_mode || !self.enabled() || !self.valid_source(irq) {
            return false;
        }
        let state = &mut self.state[irq as usize];
        if !state.contains(SourceState::ENPEND) {
            return false;
        }
        state.remove(SourceState::PENDING);
        true
    }

    pub(super) fn idc_reg(&self, idc: u32, reg: u64) -> Option<u32> {
        let i = idc as usize;
        match reg {
            aplic_regs::IDELIVERY => self.idelivery.get(i).copied(),
            aplic_regs::IFORCE => self.iforce.get(i).copied(),
            aplic_regs::ITHRESHOLD => self.ithreshold.get(i).copied(),
            _ => None,
        }
    }

    pub(super) fn write_idc_reg(&mut self, idc: u32, reg: u64, value: u32) -> bool {
        let i = idc as usize;
        if i >= self.idelivery.len() {
            return false;
        }
        match reg {
            aplic_regs::IDELIVERY => self.idelivery[i] = value & 1,
            aplic_regs::IFORCE => self.iforce[i] = value & 1,
            aplic_regs::ITHRESHOLD => self.ithreshold[i] = value & self.iprio_mask,
            // topi and claimi ignore writes
            aplic_regs::TOPI | aplic_regs::CLAIMI => {}
            _ => return false,
        }
        true
    }

    /// Highest-priority deliverable source for `idc` as `(source, priority)`
    ///
    /// Lower priority values win; ties go to the lowest source number.
    pub fn topi(&self, idc: u32) -> Option<(u32, u32)> {
        let threshold = *self.ithreshold.get(idc as usize)?;
        let mut best: Option<(u32, u32)> = None;

        for irq in 1..=self.config.num_sources {
            if !self.state[irq as usize].contains(SourceState::ENPEND) {
                continue;
            }
            if self.wired_hart(irq) != idc {
                continue;
            }
            let prio = self.target[irq as usize] & self.iprio_mask;
            if threshold != 0 && prio >= threshold {
                continue;
            }
            if best.map_or(true, |(_, best_prio)| prio < best_prio) {
                best = Some((irq, prio));
            }
        }
        best
    }

    /// `topi` register encoding
    pub(super) fn topi_value(&self, idc: u32) -> u32 {
        self.topi(idc)
            .map_or(0, |(irq, prio)| (irq << TOPI_ID_SHIFT) | prio)
    }

    /// Claim the current winner for `idc`
    ///
    /// A level source whose input is still asserted stays pending.
    pub fn claim(&mut self, idc: u32) -> Option<(u32, u32)> {
        match self.topi(idc) {
            None => {
                if let Some(force) = self.iforce.get_mut(idc as usize) {
                    *force = 0;
                }
                None
            }
            Some((irq, prio)) => {
                self.set_pending_raw(irq, false);
                let relatch = self.mode(irq).map_or(false, SourceMode::is_level)
                    && self.rectified_input(irq);
                if relatch {
                    self.set_pending_raw(irq, true);
                }
                Some((irq, prio))
            }
        }
    }

    /// Drive the external interrupt line of `idc`
    pub(super) fn idc_update(&self, idc: u32) {
        let i = idc as usize;
        let Some(output) = self.outputs.get(i) else {
            return;
        };
        let level = self.enabled()
            && self.idelivery[i] != 0
            && (self.iforce[i] != 0 || self.topi(idc).is_some());
        output.set(level);
    }

    /// Clear runtime state; `sourcecfg`, targets and MSI addresses survive
    pub(super) fn reset(&mut self) {
        self.domaincfg = DomainCfg::empty();
        self.genmsi = 0;
        for state in self.state.iter_mut() {
            state.remove(SourceState::ENPEND);
        }
        self.idelivery.iter_mut().for_each(|v| *v = 0);
        self.iforce.iter_mut().for_each(|v| *v = 0);
        self.ithreshold.iter_mut().for_each(|v| *v = 0);
    }

    pub(super) fn snapshot(&self) -> AplicDomainSnapshot {
        AplicDomainSnapshot {
            domaincfg: self.domaincfg.bits(),
            mmsiaddrcfg: self.mmsiaddrcfg,
            mmsiaddrcfgh: self.mmsiaddrcfgh,
            smsiaddrcfg: self.smsiaddrcfg,
            smsiaddrcfgh: self.smsiaddrcfgh,
            genmsi: self.genmsi,
            sourcecfg: self.sourcecfg.clone(),
            state: self.state.iter().map(|s| s.bits()).collect(),
            target: self.target.clone(),
            idelivery: self.idelivery.clone(),
            iforce: self.iforce.clone(),
            ithreshold: self.ithreshold.clone(),
        }
    }

    /// Returns `false` if the snapshot does not fit this domain's shape
    pub(super) fn restore(&mut self, snap: &AplicDomainSnapshot) -> bool {
        if snap.sourcecfg.len() != self.sourcecfg.len()
            || snap.state.len() != self.state.len()
            || snap.target.len() != self.target.len()
            || snap.idelivery.len() != self.idelivery.len()
            || snap.iforce.len() != self.iforce.len()
            || snap.ithreshold.len() != self.ithreshold.len()
        {
            return false;
        }
        self.write_domaincfg(snap.domaincfg);
        self.mmsiaddrcfg = snap.mmsiaddrcfg;
        self.mmsiaddrcfgh = snap.mmsiaddrcfgh & MMSIADDRCFGH_VALID;
        self.smsiaddrcfg = snap.smsiaddrcfg;
        self.smsiaddrcfgh = snap.smsiaddrcfgh & SMSIADDRCFGH_VALID;
        self.genmsi = snap.genmsi;
        self.sourcecfg.copy_from_slice(&snap.sourcecfg);
        for (state, bits) in self.state.iter_mut().zip(&snap.state) {
            *state = SourceState::from_bits_truncate(*bits);
        }
        self.target.copy_from_slice(&snap.target);
        self.idelivery.copy_from_slice(&snap.idelivery);
        self.iforce.copy_from_slice(&snap.iforce);
        self.ithreshold.copy_from_slice(&snap.ithreshold);
        true
    }
}
