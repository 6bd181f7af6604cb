//! ACLINT MSWI / SSWI devices
//!
//! One 32-bit doorbell per hart. The machine-level variant drives MSIP
//! from its own state. The supervisor-level variant only ever raises
//! SSIP and reads back the hart's architectural pending bit, since SSIP
//! is cleared by the hart itself.

use alloc::vec::Vec;

use crate::config::SwiConfig;
use crate::emulator::{check_access, unmapped, Emulator};
use crate::hal::{HartRegistry, IrqLine, IrqOutput};
use crate::{Error, Result};

/// Software interrupt emulator (MSWI or SSWI)
pub struct Swi {
    config: SwiConfig,
    outputs: Vec<IrqOutput>,
    doorbells: Vec<bool>,
}

impl Swi {
    /// Create a software interrupt block for `config.num_harts` harts
    pub fn new<R: HartRegistry + ?Sized>(config: SwiConfig, registry: &R) -> Result<Self> {
        config.validate()?;

        let line = if config.supervisor {
            IrqLine::SupervisorSoftware
        } else {
            IrqLine::MachineSoftware
        };
        let outputs = (0..config.num_harts)
            .map(|i| IrqOutput::resolve(registry, config.hartid_base + i, line))
            .collect::<Result<Vec<_>>>()?;
        let doorbells = alloc::vec![false; config.num_harts as usize];

        log::info!(
            "{} at {:#x}: {} harts from {}",
            if config.supervisor { "SSWI" } else { "MSWI" },
            config.base_address,
            config.num_harts,
            config.hartid_base
        );

        Ok(Self {
            config,
            outputs,
            doorbells,
        })
    }

    /// Whether this is the supervisor-level variant
    pub fn is_supervisor(&self) -> bool {
        self.config.supervisor
    }

    /// Ring or clear hart `index`'s doorbell
    pub fn write_doorbell(&mut self, index: u32, set: bool) -> Result<()> {
        let output = self
            .outputs
            .get(index as usize)
            .ok_or(Error::InvalidArgument)?;

        if set {
            output.raise();
        } else if !self.config.supervisor {
            output.lower();
        }
        if !self.config.supervisor {
            self.doorbells[index as usize] = set;
        }
        log::trace!("SWI: hart {} doorbell <- {}", output.hart_id(), set);
        Ok(())
    }

    /// Read hart `index`'s doorbell
    pub fn read_doorbell(&self, index: u32) -> Result<bool> {
        let output = self
            .outputs
            .get(index as usize)
            .ok_or(Error::InvalidArgument)?;

        if self.config.supervisor {
            Ok(output.pending())
        } else {
            Ok(self.doorbells[index as usize])
        }
    }

    fn doorbell_index(&self, offset: u64) -> Option<u32> {
        let index = offset / 4;
        (index < u64::from(self.config.num_harts)).then_some(index as u32)
    }
}

impl Emulator for Swi {
    fn name(&self) -> &str {
        if self.config.supervisor {
            "aclint-sswi"
        } else {
            "aclint-mswi"
        }
    }

    fn aperture_size(&self) -> u64 {
        SwiConfig::APERTURE_SIZE
    }

    fn read(&mut self, offset: u64, size: u32) -> Result<u64> {
        check_access(self.name(), offset, size, &[4])?;
        match self.doorbell_index(offset) {
            Some(index) => self.read_doorbell(index).map(u64::from),
            None => Err(unmapped(self.name(), offset, None)),
        }
    }

    fn write(&mut self, offset: u64, value: u64, size: u32) -> Result<()> {
        check_access(self.name(), offset, size, &[4])?;
        match self.doorbell_index(offset) {
            Some(index) => self.write_doorbell(index, value & 1 != 0),
            None => Err(unmapped(self.name(), offset, Some(value))),
        }
    }

    fn reset(&mut self) {
        if self.config.supervisor {
            return;
        }
        for (output, doorbell) in self.outputs.iter().zip(self.doorbells.iter_mut()) {
            output.lower();
            *doorbell = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harts;

    fn config(num_harts: u32, supervisor: bool) -> SwiConfig {
        let base = if supervisor {
            SwiConfig::supervisor_default()
        } else {
            SwiConfig::default()
        };
        SwiConfig { num_harts, ..base }
    }

    #[test]
    fn test_mswi_doorbell() {
        let (recorders, registry) = harts(0, 2);
        let mut mswi = Swi::new(config(2, false), &registry).unwrap();

        mswi.write(0x4, 0xffff_ffff, 4).unwrap();
        assert!(recorders[1].level(IrqLine::MachineSoftware));
        assert!(!recorders[0].level(IrqLine::MachineSoftware));
        assert_eq!(mswi.read(0x4, 4), Ok(1));

        mswi.write(0x4, 0, 4).unwrap();
        assert!(!recorders[1].level(IrqLine::MachineSoftware));
        assert_eq!(mswi.read(0x4, 4), Ok(0));
    }

    #[test]
    fn test_sswi_clear_is_ignored() {
        let (recorders, registry) = harts(0, 1);
        let mut sswi = Swi::new(config(1, true), &registry).unwrap();

        sswi.write_doorbell(0, true).unwrap();
        assert!(recorders[0].level(IrqLine::SupervisorSoftware));
        sswi.write_doorbell(0, false).unwrap();
        assert!(recorders[0].level(IrqLine::SupervisorSoftware));

        // Hart clears SSIP itself; the read follows it
        recorders[0].force(IrqLine::SupervisorSoftware, false);
        assert_eq!(sswi.read_doorbell(0), Ok(false));
    }

    #[test]
    fn test_swi_bad_offsets() {
        let (_recorders, registry) = harts(0, 1);
        let mut mswi = Swi::new(config(1, false), &registry).unwrap();
        assert_eq!(mswi.read(0x4, 4), Err(Error::InvalidOffset));
        assert_eq!(mswi.write(0x0, 1, 8), Err(Error::InvalidAccess));
        assert_eq!(mswi.write_doorbell(3, true), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_swi_missing_hart() {
        let (_recorders, registry) = harts(0, 1);
        assert_eq!(
            Swi::new(config(2, false), &registry).err(),
            Some(Error::HartNotFound(1))
        );
    }

    #[test]
    fn test_mswi_reset() {
        let (recorders, registry) = harts(0, 2);
        let mut mswi = Swi::new(config(2, false), &registry).unwrap();
        mswi.write_doorbell(0, true).unwrap();
        mswi.write_doorbell(1, true).unwrap();
        mswi.reset();
        for (i, hart) in recorders.iter().enumerate() {
            assert!(!hart.level(IrqLine::MachineSoftware));
            assert_eq!(mswi.read_doorbell(i as u32), Ok(false));
        }
    }
}
