//! MSI target address composition
//!
//! The root machine-level domain holds the address configuration for
//! both privilege levels. A target hart index is split into a group
//! number (high bits, above `LHXW`) and a hart number within the group,
//! which are OR-ed into the base PPN together with the guest index:
//!
//! ```text
//! PPN = base | (group << (HHXS + 12)) | (hart << LHXS) | guest
//! address = PPN << 12
//! ```

use super::regs::*;
use crate::hal::PhysAddr;

/// Page shift of MSI addresses
const MSI_PPN_SHIFT: u32 = 12;

/// Decoded MSI address configuration for one privilege level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsiAddrCfg {
    /// Base physical page number
    pub base_ppn: u64,
    /// Hart index shift (guest index bits)
    pub lhxs: u32,
    /// Width of the hart number within a group
    pub lhxw: u32,
    /// Width of the group number
    pub hhxw: u32,
    /// Group number shift
    pub hhxs: u32,
}

fn low_mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

impl MsiAddrCfg {
    /// Decode `xmsiaddrcfg`/`xmsiaddrcfgh`, taking the shared group
    /// fields from `mmsiaddrcfgh`
    pub fn from_regs(addrcfg: u32, addrcfgh: u32, mmsiaddrcfgh: u32) -> Self {
        Self {
            base_ppn: u64::from(addrcfg)
                | (u64::from(addrcfgh & MSIADDRCFGH_BAPPN_MASK) << 32),
            lhxs: (addrcfgh >> MSIADDRCFGH_LHXS_SHIFT) & MSIADDRCFGH_LHXS_MASK,
            lhxw: (mmsiaddrcfgh >> MSIADDRCFGH_LHXW_SHIFT) & MSIADDRCFGH_LHXW_MASK,
            hhxw: (mmsiaddrcfgh >> MSIADDRCFGH_HHXW_SHIFT) & MSIADDRCFGH_HHXW_MASK,
            hhxs: (mmsiaddrcfgh >> MSIADDRCFGH_HHXS_SHIFT) & MSIADDRCFGH_HHXS_MASK,
        }
    }

    /// Physical address of the interrupt file for `hart_index`/`guest_index`
    pub fn address(&self, hart_index: u32, guest_index: u32) -> PhysAddr {
        let hart_index = u64::from(hart_index);
        let group = (hart_index >> self.lhxw) & low_mask(self.hhxw);
        let hart = hart_index & low_mask(self.lhxw);
        let guest = u64::from(guest_index) & low_mask(self.lhxs);

        let ppn = self.base_ppn
            | (group << (self.hhxs + MSI_PPN_SHIFT))
            | (hart << self.lhxs)
            | guest;
        ppn << MSI_PPN_SHIFT
    }
}
