//! RISC-V ACLINT (Advanced Core Local Interruptor) emulation
//!
//! This module provides the two ACLINT device classes:
//! - MTIMER: shared `mtime` counter and per-hart `mtimecmp` registers
//! - SWI: per-hart software interrupt doorbells (MSWI and SSWI)

pub mod mtimer;
pub mod swi;

pub use mtimer::{Mtimer, MtimerSnapshot};
pub use swi::Swi;

/// Which part of a 64-bit register an access covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// All 64 bits
    Full,
    /// Bits 31:0
    Low,
    /// Bits 63:32
    High,
}

impl Access {
    /// Decode an MMIO access at byte `offset` within an 8-byte register
    pub(crate) fn from_mmio(offset: u64, size: u32) -> Self {
        match (size, offset & 0x7) {
            (8, _) => Access::Full,
            (_, 4) => Access::High,
            _ => Access::Low,
        }
    }

    /// Merge `value` into `current` according to the covered half
    pub fn merge(self, current: u64, value: u64) -> u64 {
        match self {
            Access::Full => value,
            Access::Low => (current & !0xffff_ffff) | (value & 0xffff_ffff),
            Access::High => (current & 0xffff_ffff) | (value << 32),
        }
    }

    /// Extract the covered half of `value`
    pub fn extract(self, value: u64) -> u64 {
        match self {
            Access::Full => value,
            Access::Low => value & 0xffff_ffff,
            Access::High => value >> 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_merge() {
        let reg = 0x1111_2222_3333_4444;
        assert_eq!(Access::Low.merge(reg, 0xaaaa_bbbb), 0x1111_2222_aaaa_bbbb);
        assert_eq!(Access::High.merge(reg, 0xaaaa_bbbb), 0xaaaa_bbbb_3333_4444);
        assert_eq!(Access::Full.merge(reg, 5), 5);
        assert_eq!(Access::High.extract(reg), 0x1111_2222);
    }

    #[test]
    fn test_access_from_mmio() {
        assert_eq!(Access::from_mmio(0x10, 8), Access::Full);
        assert_eq!(Access::from_mmio(0x10, 4), Access::Low);
        assert_eq!(Access::from_mmio(0x14, 4), Access::High);
    }
}
