//! Construction-time configuration
//!
//! These structures describe the board wiring consumed by the device
//! models. Defaults follow the QEMU `virt` machine with `aia=aplic-imsic`.
//! Every config has a `validate()` step; a failure there is a broken VM
//! description and is reported as [`Error::InvalidConfig`].

use crate::{Error, Result};

/// Default timebase frequency (10 MHz)
pub const DEFAULT_TIMEBASE_FREQ: u64 = 10_000_000;

/// Maximum harts addressable by one ACLINT block
pub const ACLINT_MAX_HARTS: u32 = 4095;

/// IMSIC interrupt file page size
pub const IMSIC_PAGE_SIZE: u64 = 0x1000;

/// ACLINT MTIMER configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtimerConfig {
    /// MTIMER base address
    pub base_address: u64,
    /// Size of the register aperture
    pub aperture_size: u64,
    /// First hart served by this block
    pub hartid_base: u32,
    /// Number of harts served
    pub num_harts: u32,
    /// Ticks per second of `mtime`
    pub timebase_freq: u64,
    /// Offset of `mtimecmp[0]`
    pub timecmp_base: u64,
    /// Offset of `mtime`
    pub time_base: u64,
}

impl Default for MtimerConfig {
    fn default() -> Self {
        Self {
            base_address: 0x0200_4000,
            aperture_size: 0x8000,
            hartid_base: 0,
            num_harts: 1,
            timebase_freq: DEFAULT_TIMEBASE_FREQ,
            timecmp_base: 0x0000,
            time_base: 0x7ff8,
        }
    }
}

impl MtimerConfig {
    /// Check the register layout fits the aperture
    pub fn validate(&self) -> Result<()> {
        if self.num_harts == 0 || self.num_harts > ACLINT_MAX_HARTS {
            log::error!("MTIMER: invalid hart count {}", self.num_harts);
            return Err(Error::InvalidConfig);
        }
        if self.timebase_freq == 0 {
            log::error!("MTIMER: timebase frequency must be non-zero");
            return Err(Error::InvalidConfig);
        }
        let timecmp_end = self.timecmp_base + u64::from(self.num_harts) * 8;
        if self.timecmp_base % 8 != 0 || self.time_base % 8 != 0 {
            log::error!("MTIMER: register bases must be 8-byte aligned");
            return Err(Error::InvalidConfig);
        }
        if timecmp_end > self.aperture_size || self.time_base + 8 > self.aperture_size {
            log::error!("MTIMER: registers exceed aperture {:#x}", self.aperture_size);
            return Err(Error::InvalidConfig);
        }
        if self.time_base >= self.timecmp_base && self.time_base < timecmp_end {
            log::error!("MTIMER: mtime overlaps the mtimecmp block");
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

/// ACLINT MSWI/SSWI configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwiConfig {
    /// Base address
    pub base_address: u64,
    /// First hart served by this block
    pub hartid_base: u32,
    /// Number of harts served
    pub num_harts: u32,
    /// Supervisor-level (SSWI) instead of machine-level (MSWI)
    pub supervisor: bool,
}

impl Default for SwiConfig {
    fn default() -> Self {
        Self {
            base_address: 0x0200_0000,
            hartid_base: 0,
            num_harts: 1,
            supervisor: false,
        }
    }
}

impl SwiConfig {
    /// Aperture size of a SWI block
    pub const APERTURE_SIZE: u64 = 0x4000;

    /// Default SSWI placement on the `virt` board
    pub fn supervisor_default() -> Self {
        Self {
            base_address: 0x02f0_0000,
            supervisor: true,
            ..Self::default()
        }
    }

    /// Check the hart count fits the aperture
    pub fn validate(&self) -> Result<()> {
        if self.num_harts == 0 || self.num_harts > ACLINT_MAX_HARTS {
            log::error!("SWI: invalid hart count {}", self.num_harts);
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

/// APLIC domain configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AplicConfig {
    /// Base address of the domain's register aperture
    pub base_address: u64,
    /// Size of the register aperture
    pub aperture_size: u64,
    /// First hart served by this domain
    pub hartid_base: u32,
    /// Number of harts (IDCs) served
    pub num_harts: u32,
    /// Number of interrupt sources (source 0 does not exist)
    pub num_sources: u32,
    /// Implemented priority bits for wired delivery
    pub iprio_bits: u32,
    /// Deliver via MSI writes instead of wired lines
    pub msi_mode: bool,
    /// Machine-level domain (drives MEI) rather than supervisor-level (SEI)
    pub machine_level: bool,
}

impl Default for AplicConfig {
    fn default() -> Self {
        Self {
            base_address: 0x0c00_0000,
            aperture_size: 0x8000,
            hartid_base: 0,
            num_harts: 1,
            num_sources: 96,
            iprio_bits: 3,
            msi_mode: true,
            machine_level: true,
        }
    }
}

impl AplicConfig {
    /// Maximum interrupt sources per domain
    pub const MAX_SOURCES: u32 = 1023;
    /// Maximum interrupt delivery contexts per domain
    pub const MAX_IDCS: u32 = 1 << 14;

    /// Default supervisor-level child on the `virt` board
    pub fn supervisor_default() -> Self {
        Self {
            base_address: 0x0d00_0000,
            machine_level: false,
            ..Self::default()
        }
    }

    /// Aperture needed to hold every register of the domain
    pub fn required_aperture(&self) -> u64 {
        let idcs = if self.msi_mode { 0 } else { u64::from(self.num_harts) * 32 };
        0x4000 + idcs
    }

    /// Check limits and aperture size
    pub fn validate(&self) -> Result<()> {
        if self.num_sources == 0 || self.num_sources > Self::MAX_SOURCES {
            log::error!("APLIC: invalid source count {}", self.num_sources);
            return Err(Error::InvalidConfig);
        }
        if self.num_harts == 0 || self.num_harts > Self::MAX_IDCS {
            log::error!("APLIC: invalid hart count {}", self.num_harts);
            return Err(Error::InvalidConfig);
        }
        if !(1..=8).contains(&self.iprio_bits) {
            log::error!("APLIC: invalid priority bits {}", self.iprio_bits);
            return Err(Error::InvalidConfig);
        }
        if self.aperture_size < self.required_aperture() {
            log::error!(
                "APLIC: aperture {:#x} smaller than {:#x}",
                self.aperture_size,
                self.required_aperture()
            );
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

/// Configuration of one IMSIC (one hart, one privilege level)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImsicConfig {
    /// Base address of the hart's first interrupt file page
    pub base_address: u64,
    /// Owning hart
    pub hartid: u32,
    /// Number of implemented identities (identity 0 excluded)
    pub num_ids: u32,
    /// Number of guest interrupt files (S-level only)
    pub num_guests: u32,
    /// Machine-level file (drives MEI) rather than supervisor-level
    pub machine_level: bool,
}

impl Default for ImsicConfig {
    fn default() -> Self {
        Self {
            base_address: 0x2400_0000,
            hartid: 0,
            num_ids: 255,
            num_guests: 0,
            machine_level: true,
        }
    }
}

impl ImsicConfig {
    /// Smallest legal identity count
    pub const MIN_IDS: u32 = 63;
    /// Largest legal identity count
    pub const MAX_IDS: u32 = 2047;
    /// Largest number of guest files
    pub const MAX_GUESTS: u32 = 63;

    /// Number of interrupt file pages (supervisor file + guests)
    pub fn num_pages(&self) -> u32 {
        1 + self.num_guests
    }

    /// Size of the MMIO aperture
    pub fn aperture_size(&self) -> u64 {
        u64::from(self.num_pages()) * IMSIC_PAGE_SIZE
    }

    /// Check identity and guest limits
    pub fn validate(&self) -> Result<()> {
        if self.num_ids < Self::MIN_IDS
            || self.num_ids > Self::MAX_IDS
            || (self.num_ids + 1) % 64 != 0
        {
            log::error!("IMSIC: invalid identity count {}", self.num_ids);
            return Err(Error::InvalidConfig);
        }
        if self.num_guests > Self::MAX_GUESTS {
            log::error!("IMSIC: too many guest files {}", self.num_guests);
            return Err(Error::InvalidConfig);
        }
        if self.machine_level && self.num_guests != 0 {
            log::error!("IMSIC: machine-level files cannot have guests");
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

/// Placement of the per-hart IMSIC files on the board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImsicLayout {
    /// Base of the machine-level files
    pub m_base: u64,
    /// Base of the supervisor-level files
    pub s_base: u64,
    /// Identities per file
    pub num_ids: u32,
    /// Guest files per hart
    pub num_guests: u32,
}

impl Default for ImsicLayout {
    fn default() -> Self {
        Self {
            m_base: 0x2400_0000,
            s_base: 0x2800_0000,
            num_ids: 255,
            num_guests: 0,
        }
    }
}

impl ImsicLayout {
    /// Number of guest-index bits needed by the supervisor files
    pub fn guest_bits(&self) -> u32 {
        let pages = self.num_guests + 1;
        u32::BITS - (pages - 1).leading_zeros()
    }

    /// Distance between consecutive harts' supervisor files
    pub fn s_stride(&self) -> u64 {
        IMSIC_PAGE_SIZE << self.guest_bits()
    }

    /// File configuration for the hart at `index`
    pub fn file_config(&self, hartid: u32, index: u32, machine_level: bool) -> ImsicConfig {
        let (base_address, num_guests) = if machine_level {
            (self.m_base + u64::from(index) * IMSIC_PAGE_SIZE, 0)
        } else {
            (self.s_base + u64::from(index) * self.s_stride(), self.num_guests)
        };
        ImsicConfig {
            base_address,
            hartid,
            num_ids: self.num_ids,
            num_guests,
            machine_level,
        }
    }
}

/// Board-level configuration for the whole interrupt subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    /// First hart of the cluster
    pub hartid_base: u32,
    /// Number of harts in the cluster
    pub num_harts: u32,
    /// MTIMER block
    pub mtimer: MtimerConfig,
    /// Machine-level software interrupts
    pub mswi: SwiConfig,
    /// Optional supervisor-level software interrupts
    pub sswi: Option<SwiConfig>,
    /// Root machine-level APLIC domain
    pub aplic_m: AplicConfig,
    /// Optional supervisor-level child domain
    pub aplic_s: Option<AplicConfig>,
    /// IMSIC files; required when the APLIC runs in MSI mode
    pub imsic: Option<ImsicLayout>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self::aplic_imsic(1)
    }
}

impl PlatformConfig {
    /// `virt` board with wired APLIC delivery
    pub fn aplic_wired(num_harts: u32) -> Self {
        let mut config = Self::aplic_imsic(num_harts);
        config.aplic_m.msi_mode = false;
        config.aplic_m.aperture_size = config.aplic_m.required_aperture().max(0x8000);
        if let Some(s) = config.aplic_s.as_mut() {
            s.msi_mode = false;
            s.aperture_size = s.required_aperture().max(0x8000);
        }
        config.imsic = None;
        config
    }

    /// `virt` board with APLIC forwarding to IMSIC files
    pub fn aplic_imsic(num_harts: u32) -> Self {
        Self {
            hartid_base: 0,
            num_harts,
            mtimer: MtimerConfig {
                num_harts,
                ..MtimerConfig::default()
            },
            mswi: SwiConfig {
                num_harts,
                ..SwiConfig::default()
            },
            sswi: Some(SwiConfig {
                num_harts,
                ..SwiConfig::supervisor_default()
            }),
            aplic_m: AplicConfig {
                num_harts,
                ..AplicConfig::default()
            },
            aplic_s: Some(AplicConfig {
                num_harts,
                ..AplicConfig::supervisor_default()
            }),
            imsic: Some(ImsicLayout::default()),
        }
    }

    /// Check every component and the cross-component wiring
    pub fn validate(&self) -> Result<()> {
        let harts = [
            Some(("mtimer", self.mtimer.hartid_base, self.mtimer.num_harts)),
            Some(("mswi", self.mswi.hartid_base, self.mswi.num_harts)),
            Some(("aplic-m", self.aplic_m.hartid_base, self.aplic_m.num_harts)),
            self.sswi.as_ref().map(|c| ("sswi", c.hartid_base, c.num_harts)),
            self.aplic_s.as_ref().map(|c| ("aplic-s", c.hartid_base, c.num_harts)),
        ];
        for (name, base, count) in harts.into_iter().flatten() {
            if (base, count) != (self.hartid_base, self.num_harts) {
                log::error!(
                    "platform: {} serves harts {}+{}, cluster is {}+{}",
                    name,
                    base,
                    count,
                    self.hartid_base,
                    self.num_harts
                );
                return Err(Error::InvalidConfig);
            }
        }

        self.mtimer.validate()?;
        self.mswi.validate()?;
        if let Some(sswi) = &self.sswi {
            sswi.validate()?;
        }
        self.aplic_m.validate()?;
        if !self.aplic_m.machine_level {
            log::error!("platform: root APLIC domain must be machine-level");
            return Err(Error::InvalidConfig);
        }
        if let Some(s) = &self.aplic_s {
            s.validate()?;
            if s.machine_level {
                log::error!("platform: child APLIC domain must be supervisor-level");
                return Err(Error::InvalidConfig);
            }
            if s.num_sources != self.aplic_m.num_sources {
                return Err(Error::SourceCountMismatch);
            }
        }
        let needs_imsic = self.aplic_m.msi_mode
            || self.aplic_s.as_ref().map_or(false, |s| s.msi_mode);
        match &self.imsic {
            Some(layout) => layout
                .file_config(self.hartid_base, 0, false)
                .validate()?,
            None if needs_imsic => {
                log::error!("platform: MSI-mode APLIC requires IMSIC files");
                return Err(Error::InvalidConfig);
            }
            None => {}
        }
        Ok(())
    }
}
