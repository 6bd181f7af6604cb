//! Device emulators
//!
//! This module contains the interrupt controller models that are
//! presented to guest operating systems. Each device exposes its
//! register aperture through the [`Emulator`] trait; the hosting bus
//! dispatches guest accesses by address range.

pub mod aclint;
pub mod aplic;
pub mod imsic;

use crate::{Error, Result};

/// Trait for memory-mapped device emulators
///
/// Guest protocol errors are returned as `Err` after being logged by the
/// device; callers turn them into the masked default (all-ones read,
/// dropped write) so they never become fatal.
pub trait Emulator {
    /// Get emulator name
    fn name(&self) -> &str;

    /// Size of the register aperture in bytes
    fn aperture_size(&self) -> u64;

    /// Read from device register
    fn read(&mut self, offset: u64, size: u32) -> Result<u64>;

    /// Write to device register
    fn write(&mut self, offset: u64, value: u64, size: u32) -> Result<()>;

    /// Reset device
    fn reset(&mut self);
}

/// Value returned for a read the device rejected
pub fn rejected_read_value(size: u32) -> u64 {
    size_mask(size)
}

/// Mask covering an access of `size` bytes
pub fn size_mask(size: u32) -> u64 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        4 => 0xffff_ffff,
        _ => u64::MAX,
    }
}

/// Check that an access is naturally aligned and of a permitted size
pub fn check_access(name: &str, offset: u64, size: u32, sizes: &[u32]) -> Result<()> {
    if !sizes.contains(&size) || offset % u64::from(size) != 0 {
        log::warn!(
            "{}: invalid {}-byte access at offset {:#x}",
            name,
            size,
            offset
        );
        return Err(Error::InvalidAccess);
    }
    Ok(())
}

/// Log and report an access to an unmapped offset
pub(crate) fn unmapped(name: &str, offset: u64, write: Option<u64>) -> Error {
    match write {
        Some(value) => log::warn!(
            "{}: unhandled write {:#x} to offset {:#x}",
            name,
            value,
            offset
        ),
        None => log::warn!("{}: unhandled read from offset {:#x}", name, offset),
    }
    Error::InvalidOffset
}
