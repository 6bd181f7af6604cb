//! One IMSIC interrupt file
//!
//! Identity state is kept in atomics so MSI stores from any hart can
//! set pending bits without taking the platform lock.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::hal::IrqOutput;

/// Identity is pending
pub const EISTATE_PENDING: u32 = 1 << 0;
/// Identity is enabled
pub const EISTATE_ENABLED: u32 = 1 << 1;
pub const EISTATE_ENPEND: u32 = EISTATE_PENDING | EISTATE_ENABLED;

/// Largest value `eithreshold` can hold
pub const MAX_ID: u32 = 0x7ff;

/// Interrupt file state for one privilege level (or one guest)
pub struct InterruptFile {
    output: IrqOutput,
    eidelivery: AtomicU32,
    eithreshold: AtomicU32,
    /// Indexed by identity; slot 0 holds the line status instead of an
    /// identity, since identity 0 does not exist
    eistate: Vec<AtomicU32>,
}

impl InterruptFile {
    pub fn new(output: IrqOutput, num_ids: u32) -> Self {
        Self {
            output,
            eidelivery: AtomicU32::new(0),
            eithreshold: AtomicU32::new(0),
            eistate: (0..=num_ids).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Number of identity slots, including the reserved slot 0
    pub fn slots(&self) -> u32 {
        self.eistate.len() as u32
    }

    pub fn output(&self) -> &IrqOutput {
        &self.output
    }

    pub fn state(&self, id: u32) -> u32 {
        match id {
            0 => 0,
            _ => self
                .eistate
                .get(id as usize)
                .map_or(0, |s| s.load(Ordering::SeqCst)),
        }
    }

    /// Set or clear `bits` for identity `id`, returning the previous state
    pub fn update_state(&self, id: u32, bits: u32, set: bool) -> u32 {
        let Some(slot) = self.eistate.get(id as usize).filter(|_| id != 0) else {
            return 0;
        };
        if set {
            slot.fetch_or(bits, Ordering::SeqCst)
        } else {
            slot.fetch_and(!bits, Ordering::SeqCst)
        }
    }

    pub fn eidelivery(&self) -> u32 {
        self.eidelivery.load(Ordering::SeqCst)
    }

    pub fn eithreshold(&self) -> u32 {
        self.eithreshold.load(Ordering::SeqCst)
    }

    /// Masked update of `eidelivery`, returning the old value
    pub fn rmw_eidelivery(&self, new_val: u32, wr_mask: u32) -> u32 {
        rmw_word(&self.eidelivery, new_val, wr_mask & 1)
    }

    /// Masked update of `eithreshold`, returning the old value
    pub fn rmw_eithreshold(&self, new_val: u32, wr_mask: u32) -> u32 {
        rmw_word(&self.eithreshold, new_val, wr_mask & MAX_ID)
    }

    /// Lowest deliverable identity under the current threshold
    pub fn topei(&self) -> Option<u32> {
        let threshold = self.eithreshold();
        let limit = if threshold != 0 && threshold <= self.slots() {
            threshold
        } else {
            self.slots()
        };
        (1..limit).find(|&id| self.state(id) & EISTATE_ENPEND == EISTATE_ENPEND)
    }

    /// Mark `id` pending; identity 0 and out-of-range values are ignored
    pub fn set_pending(&self, id: u32) -> bool {
        if id == 0 || id >= self.slots() {
            return false;
        }
        self.update_state(id, EISTATE_PENDING, true);
        true
    }

    /// Re-evaluate the external interrupt line
    ///
    /// The status slot is cleared (lowering the line) before the file is
    /// evaluated and set again after raising it, so an identity that
    /// becomes pending concurrently is never lost; at worst the line
    /// pulses.
    pub fn update(&self) {
        let status = &self.eistate[0];
        if status.fetch_and(!EISTATE_ENPEND, Ordering::SeqCst) != 0 {
            self.output.lower();
        }
        if self.eidelivery() != 0 && self.topei().is_some() {
            self.output.raise();
            status.fetch_or(EISTATE_ENPEND, Ordering::SeqCst);
        }
    }

    /// Clear delivery, threshold and every identity
    pub fn reset(&self) {
        self.eidelivery.store(0, Ordering::SeqCst);
        self.eithreshold.store(0, Ordering::SeqCst);
        for slot in self.eistate.iter().skip(1) {
            slot.store(0, Ordering::SeqCst);
        }
        self.update();
    }

    pub(super) fn store_raw(&self, eidelivery: u32, eithreshold: u32, eistate: &[u32]) {
        self.eidelivery.store(eidelivery & 1, Ordering::SeqCst);
        self.eithreshold.store(eithreshold & MAX_ID, Ordering::SeqCst);
        for (slot, value) in self.eistate.iter().zip(eistate).skip(1) {
            slot.store(value & EISTATE_ENPEND, Ordering::SeqCst);
        }
        self.update();
    }
}

fn rmw_word(word: &AtomicU32, new_val: u32, wr_mask: u32) -> u32 {
    let mut old = word.load(Ordering::SeqCst);
    loop {
        let value = (old & !wr_mask) | (new_val & wr_mask);
        match word.compare_exchange_weak(old, value, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(prev) => return prev,
            Err(current) => old = current,
        }
    }
}
