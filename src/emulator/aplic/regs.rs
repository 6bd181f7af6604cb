//! APLIC register map and field encodings

use bitflags::bitflags;

/// APLIC register offsets
pub mod aplic_regs {
    pub const DOMAINCFG: u64 = 0x0000;
    // sourcecfg[1..=1023], 4 bytes each
    pub const SOURCECFG_BASE: u64 = 0x0004;
    pub const MMSIADDRCFG: u64 = 0x1bc0;
    pub const MMSIADDRCFGH: u64 = 0x1bc4;
    pub const SMSIADDRCFG: u64 = 0x1bc8;
    pub const SMSIADDRCFGH: u64 = 0x1bcc;
    // 32-bit windows indexed by source word
    pub const SETIP_BASE: u64 = 0x1c00;
    pub const SETIPNUM: u64 = 0x1cdc;
    pub const IN_CLRIP_BASE: u64 = 0x1d00;
    pub const CLRIPNUM: u64 = 0x1ddc;
    pub const SETIE_BASE: u64 = 0x1e00;
    pub const SETIENUM: u64 = 0x1edc;
    pub const CLRIE_BASE: u64 = 0x1f00;
    pub const CLRIENUM: u64 = 0x1fdc;
    pub const SETIPNUM_LE: u64 = 0x2000;
    pub const SETIPNUM_BE: u64 = 0x2004;
    pub const GENMSI: u64 = 0x3000;
    // target[1..=1023], 4 bytes each
    pub const TARGET_BASE: u64 = 0x3004;
    // Interrupt delivery contexts, 32 bytes each
    pub const IDC_BASE: u64 = 0x4000;
    pub const IDC_SIZE: u64 = 32;
    pub const IDELIVERY: u64 = 0x00;
    pub const IFORCE: u64 = 0x04;
    pub const ITHRESHOLD: u64 = 0x08;
    pub const TOPI: u64 = 0x18;
    pub const CLAIMI: u64 = 0x1c;

    /// Number of 32-bit words in each bit-vector window
    pub const BITMAP_WORDS: u64 = 32;
}

bitflags! {
    /// `domaincfg` fields
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DomainCfg: u32 {
        /// Big-endian registers (read-only zero here)
        const BE = 1 << 0;
        /// MSI delivery mode
        const DM = 1 << 2;
        /// Interrupt enable
        const IE = 1 << 8;
        /// Reads as one
        const RDONLY = 0x80 << 24;
    }
}

bitflags! {
    /// Per-source state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SourceState: u32 {
        const PENDING = 1 << 0;
        const ENABLED = 1 << 1;
        /// Raw input wire level
        const INPUT = 1 << 8;
        const ENPEND = Self::PENDING.bits() | Self::ENABLED.bits();
    }
}

/// `sourcecfg` delegate bit
pub const SOURCECFG_D: u32 = 1 << 10;
/// `sourcecfg` child index when D is set
pub const SOURCECFG_CHILDIDX_MASK: u32 = 0x3ff;
/// `sourcecfg` source mode when D is clear
pub const SOURCECFG_SM_MASK: u32 = 0x7;

/// `msiaddrcfgh` lock
pub const MSIADDRCFGH_L: u32 = 1 << 31;
pub const MSIADDRCFGH_HHXS_SHIFT: u32 = 24;
pub const MSIADDRCFGH_HHXS_MASK: u32 = 0x1f;
pub const MSIADDRCFGH_LHXS_SHIFT: u32 = 20;
pub const MSIADDRCFGH_LHXS_MASK: u32 = 0x7;
pub const MSIADDRCFGH_HHXW_SHIFT: u32 = 16;
pub const MSIADDRCFGH_HHXW_MASK: u32 = 0x7;
pub const MSIADDRCFGH_LHXW_SHIFT: u32 = 12;
pub const MSIADDRCFGH_LHXW_MASK: u32 = 0xf;
/// High bits of the base PPN
pub const MSIADDRCFGH_BAPPN_MASK: u32 = 0xfff;

pub const MMSIADDRCFGH_VALID: u32 = MSIADDRCFGH_L
    | (MSIADDRCFGH_HHXS_MASK << MSIADDRCFGH_HHXS_SHIFT)
    | (MSIADDRCFGH_LHXS_MASK << MSIADDRCFGH_LHXS_SHIFT)
    | (MSIADDRCFGH_HHXW_MASK << MSIADDRCFGH_HHXW_SHIFT)
    | (MSIADDRCFGH_LHXW_MASK << MSIADDRCFGH_LHXW_SHIFT)
    | MSIADDRCFGH_BAPPN_MASK;
pub const SMSIADDRCFGH_VALID: u32 =
    (MSIADDRCFGH_LHXS_MASK << MSIADDRCFGH_LHXS_SHIFT) | MSIADDRCFGH_BAPPN_MASK;

pub const TARGET_HART_IDX_SHIFT: u32 = 18;
pub const TARGET_HART_IDX_MASK: u32 = 0x3fff;
pub const TARGET_GUEST_IDX_SHIFT: u32 = 12;
pub const TARGET_GUEST_IDX_MASK: u32 = 0x3f;
pub const TARGET_EIID_MASK: u32 = 0x7ff;

pub const TOPI_ID_SHIFT: u32 = 16;
pub const TOPI_ID_MASK: u32 = 0x3ff;

/// Source mode field of `sourcecfg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Inactive,
    Detached,
    EdgeRise,
    EdgeFall,
    LevelHigh,
    LevelLow,
}

impl SourceMode {
    /// Decode an SM field; reserved encodings yield `None`
    pub fn from_bits(sm: u32) -> Option<Self> {
        match sm & SOURCECFG_SM_MASK {
            0 => Some(SourceMode::Inactive),
            1 => Some(SourceMode::Detached),
            4 => Some(SourceMode::EdgeRise),
            5 => Some(SourceMode::EdgeFall),
            6 => Some(SourceMode::LevelHigh),
            7 => Some(SourceMode::LevelLow),
            _ => None,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            SourceMode::Inactive => 0,
            SourceMode::Detached => 1,
            SourceMode::EdgeRise => 4,
            SourceMode::EdgeFall => 5,
            SourceMode::LevelHigh => 6,
            SourceMode::LevelLow => 7,
        }
    }

    pub fn is_level(self) -> bool {
        matches!(self, SourceMode::LevelHigh | SourceMode::LevelLow)
    }

    /// Input polarity is inverted before reaching the gateway
    pub fn is_inverted(self) -> bool {
        matches!(self, SourceMode::LevelLow | SourceMode::EdgeFall)
    }
}

/// Decoded `sourcecfg` register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCfg {
    /// Delegated to the child at this index
    Delegated(u32),
    /// Handled by this domain
    Local(SourceMode),
}

impl SourceCfg {
    pub fn decode(raw: u32) -> Self {
        if raw & SOURCECFG_D != 0 {
            SourceCfg::Delegated(raw & SOURCECFG_CHILDIDX_MASK)
        } else {
            SourceCfg::Local(SourceMode::from_bits(raw).unwrap_or(SourceMode::Inactive))
        }
    }

    pub fn encode(self) -> u32 {
        match self {
            SourceCfg::Delegated(child) => SOURCECFG_D | (child & SOURCECFG_CHILDIDX_MASK),
            SourceCfg::Local(mode) => mode.bits(),
        }
    }

    /// Mode used by this domain's gateway, `None` when delegated
    pub fn mode(self) -> Option<SourceMode> {
        match self {
            SourceCfg::Local(mode) => Some(mode),
            SourceCfg::Delegated(_) => None,
        }
    }
}

/// A decoded register offset within a domain aperture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    DomainCfg,
    SourceCfg(u32),
    MmsiAddrCfg,
    MmsiAddrCfgH,
    SmsiAddrCfg,
    SmsiAddrCfgH,
    SetIp(u32),
    SetIpNum,
    InClrIp(u32),
    ClrIpNum,
    SetIe(u32),
    SetIeNum,
    ClrIe(u32),
    ClrIeNum,
    SetIpNumLe,
    SetIpNumBe,
    GenMsi,
    Target(u32),
    /// IDC index and register offset within the IDC
    Idc(u32, u64),
}

fn window(offset: u64, base: u64) -> Option<u32> {
    let word = offset.checked_sub(base)? / 4;
    (word < aplic_regs::BITMAP_WORDS).then_some(word as u32)
}

fn per_source(offset: u64, base: u64, num_sources: u32) -> Option<u32> {
    let irq = offset.checked_sub(base)? / 4 + 1;
    (irq <= u64::from(num_sources)).then_some(irq as u32)
}

impl Register {
    /// Decode a word-aligned `offset` for a domain of the given shape
    ///
    /// IDCs exist only in direct delivery mode (`num_idcs > 0`) and
    /// `genmsi` only in MSI mode.
    pub fn decode(offset: u64, num_sources: u32, msi_mode: bool, num_idcs: u32) -> Option<Self> {
        use aplic_regs::*;

        let reg = match offset {
            DOMAINCFG => Register::DomainCfg,
            MMSIADDRCFG => Register::MmsiAddrCfg,
            MMSIADDRCFGH => Register::MmsiAddrCfgH,
            SMSIADDRCFG => Register::SmsiAddrCfg,
            SMSIADDRCFGH => Register::SmsiAddrCfgH,
            SETIPNUM => Register::SetIpNum,
            CLRIPNUM => Register::ClrIpNum,
            SETIENUM => Register::SetIeNum,
            CLRIENUM => Register::ClrIeNum,
            SETIPNUM_LE => Register::SetIpNumLe,
            SETIPNUM_BE => Register::SetIpNumBe,
            GENMSI if msi_mode => Register::GenMsi,
            o if (SOURCECFG_BASE..MMSIADDRCFG).contains(&o) => {
                Register::SourceCfg(per_source(o, SOURCECFG_BASE, num_sources)?)
            }
            o if (SETIP_BASE..SETIPNUM).contains(&o) => Register::SetIp(window(o, SETIP_BASE)?),
            o if (IN_CLRIP_BASE..CLRIPNUM).contains(&o) => {
                Register::InClrIp(window(o, IN_CLRIP_BASE)?)
            }
            o if (SETIE_BASE..SETIENUM).contains(&o) => Register::SetIe(window(o, SETIE_BASE)?),
            o if (CLRIE_BASE..CLRIENUM).contains(&o) => Register::ClrIe(window(o, CLRIE_BASE)?),
            o if (TARGET_BASE..IDC_BASE).contains(&o) => {
                Register::Target(per_source(o, TARGET_BASE, num_sources)?)
            }
            o if o >= IDC_BASE => {
                let idc = (o - IDC_BASE) / IDC_SIZE;
                if idc >= u64::from(num_idcs) {
                    return None;
                }
                Register::Idc(idc as u32, (o - IDC_BASE) % IDC_SIZE)
            }
            _ => return None,
        };
        Some(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0x0, SourceCfg::Local(SourceMode::Inactive))]
    #[test_case(0x4, SourceCfg::Local(SourceMode::EdgeRise))]
    #[test_case(0x7, SourceCfg::Local(SourceMode::LevelLow))]
    #[test_case(0x2, SourceCfg::Local(SourceMode::Inactive); "reserved mode")]
    #[test_case(0x402, SourceCfg::Delegated(2))]
    fn test_sourcecfg_decode(raw: u32, expected: SourceCfg) {
        assert_eq!(SourceCfg::decode(raw), expected);
    }

    #[test_case(0x0000, Some(Register::DomainCfg))]
    #[test_case(0x0004, Some(Register::SourceCfg(1)))]
    #[test_case(0x0010, Some(Register::SourceCfg(4)))]
    #[test_case(0x0014, None; "sourcecfg beyond sources")]
    #[test_case(0x1c04, Some(Register::SetIp(1)))]
    #[test_case(0x1c80, None; "setip gap")]
    #[test_case(0x1edc, Some(Register::SetIeNum))]
    #[test_case(0x3000, None; "genmsi in direct mode")]
    #[test_case(0x3004, Some(Register::Target(1)))]
    #[test_case(0x4018, Some(Register::Idc(0, 0x18)))]
    #[test_case(0x403c, Some(Register::Idc(1, 0x1c)))]
    #[test_case(0x4040, None; "idc beyond harts")]
    fn test_register_decode(offset: u64, expected: Option<Register>) {
        assert_eq!(Register::decode(offset, 4, false, 2), expected);
    }

    #[test]
    fn test_msi_mode_decode() {
        assert_eq!(Register::decode(0x3000, 4, true, 0), Some(Register::GenMsi));
        assert_eq!(Register::decode(0x4000, 4, true, 0), None);
    }

    #[test]
    fn test_domaincfg_rdonly() {
        assert_eq!(DomainCfg::RDONLY.bits(), 0x8000_0000);
        assert_eq!(SourceState::ENPEND.bits(), 0x3);
    }
}
