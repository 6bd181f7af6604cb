//! Ferrovisor AIA - RISC-V Advanced Interrupt Architecture device models
//!
//! This crate provides the virtual interrupt controllers a RISC-V guest
//! expects to find on an AIA-capable board:
//! - ACLINT MTIMER (per-hart timer compare + shared `mtime`)
//! - ACLINT MSWI/SSWI (per-hart software interrupt doorbells)
//! - APLIC (wired and MSI delivery, domain delegation tree)
//! - IMSIC (per-hart message-signaled interrupt files)
//!
//! The models are host-agnostic: harts, timers and guest memory are
//! reached through the traits in [`hal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Core modules
pub mod config;

// Host-facing collaborator interfaces
pub mod hal;

// Device emulators
pub mod emulator;

// VM topology owner
pub mod platform;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for convenience
pub use crate::config::{AplicConfig, ImsicConfig, MtimerConfig, PlatformConfig, SwiConfig};
pub use crate::hal::{GuestMemory, Hart, HartRegistry, IrqLine, IrqOutput, TimerQueue};
pub use crate::emulator::aclint::{Mtimer, Swi};
pub use crate::emulator::aplic::{AplicSystem, DomainId};
pub use crate::emulator::imsic::Imsic;
pub use crate::emulator::Emulator;
pub use crate::platform::AiaPlatform;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type for the AIA device models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Misaligned or wrongly sized register access
    InvalidAccess,
    /// Register offset not backed by any register
    InvalidOffset,
    /// Invalid argument (hart, source or identity out of range)
    InvalidArgument,
    /// Inconsistent construction-time configuration
    InvalidConfig,
    /// A hart referenced by the configuration does not exist
    HartNotFound(u32),
    /// A domain would exceed the maximum number of children
    TooManyChildren,
    /// Parent and child domains disagree on the number of sources
    SourceCountMismatch,
    /// Unknown APLIC domain handle
    DomainNotFound,
    /// Guest memory rejected a write at the given address
    MemoryFault(u64),
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidAccess => write!(f, "invalid register access"),
            Error::InvalidOffset => write!(f, "unmapped register offset"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::InvalidConfig => write!(f, "invalid configuration"),
            Error::HartNotFound(id) => write!(f, "hart {} not found", id),
            Error::TooManyChildren => write!(f, "too many child domains"),
            Error::SourceCountMismatch => write!(f, "parent/child source count mismatch"),
            Error::DomainNotFound => write!(f, "APLIC domain not found"),
            Error::MemoryFault(addr) => write!(f, "guest memory write failed at {:#x}", addr),
        }
    }
}

/// Result type alias
pub type Result<T> = core::result::Result<T, Error>;
