//! The cross-CPU spin lock: a bounded-retry test-and-set over a word in the
//! shared arena.
//!
//! A CPU blocked on a cross-CPU lock has nobody to wake it, so the lock must
//! never sleep and must never spin unboundedly -- an unbounded spin would
//! convert a stuck remote CPU into a local deadlock. `lock_take` therefore
//! performs at most `max_tries` hardware test-and-set attempts and reports a
//! timeout once they are exhausted.
//!
//! On success the local interrupt level is raised for the critical section
//! and the previous level is returned as an opaque token for the paired
//! `lock_give`. On failure the interrupt state is left exactly as found.

use core::sync::atomic::{AtomicBool, Ordering};

use kern_util::types::CpuId;

use crate::{
    cpu::{Cpu, IntLevel},
    error::ShareError,
    shared::arena::SharedArena,
};

/// Global toggle for logging spin-lock timeouts.
///
/// Under correct configuration a timeout is exceedingly rare and usually
/// means a remote CPU is stuck, so it is worth a line in the log -- but the
/// caller already gets the error, and noisy logs can be silenced wholesale.
static TIMEOUT_REPORTING: AtomicBool = AtomicBool::new(true);

/// Enables or disables the `warn` log on spin-lock timeout. Returns the
/// previous setting.
pub fn set_timeout_reporting(enabled: bool) -> bool {
    TIMEOUT_REPORTING.swap(enabled, Ordering::Relaxed)
}

/// Opaque token for a held shared-memory lock: the pre-lock interrupt level,
/// returned by [`SpinLockWord::lock_take`] and consumed by
/// [`SpinLockWord::lock_give`].
#[derive(Debug)]
#[must_use = "a taken lock must be given back with its level token"]
pub struct LockLevel(IntLevel);

/// Handle to a spin-lock word in the shared arena.
///
/// The word holds 0 when free and `holder.0 + 1` while held, so a stuck
/// holder can be identified from a memory dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinLockWord {
    off: u32,
}

impl SpinLockWord {
    /// A lock word located at the 4-aligned arena offset `off`.
    pub const fn at(off: u32) -> Self {
        SpinLockWord { off }
    }

    /// Initializes the word to the free state.
    pub fn init(&self, a: &SharedArena) {
        a.store_u32(self.off, 0);
    }

    /// One hardware test-and-set attempt. Returns `true` on acquisition.
    fn tas(&self, a: &SharedArena, cpu: CpuId) -> bool {
        let marker = (cpu.0 + 1).to_be();
        a.lock_word(self.off)
            .compare_exchange(0, marker, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Takes the lock with at most `max_tries` test-and-set attempts.
    ///
    /// On success, local interrupts are masked for the critical section and
    /// the previous level is returned. On timeout no interrupt state change
    /// remains, the failure is reported through the error return, and a
    /// `warn` is logged if [`set_timeout_reporting`] allows it.
    pub fn lock_take(
        &self,
        a: &SharedArena,
        cpu: &Cpu,
        max_tries: u32,
    ) -> Result<LockLevel, ShareError> {
        let level = cpu.int_lock();
        for _ in 0..max_tries {
            if self.tas(a, cpu.id()) {
                return Ok(LockLevel(level));
            }
            core::hint::spin_loop();
        }
        cpu.int_unlock(level);
        if TIMEOUT_REPORTING.load(Ordering::Relaxed) {
            log::warn!(
                "cpu {}: spin lock {:#x} not taken after {} tries (holder {})",
                cpu.id(),
                self.off,
                max_tries,
                a.load_u32(self.off).wrapping_sub(1),
            );
        }
        Err(ShareError::LockTimeout)
    }

    /// Releases the lock and restores the interrupt level recorded by
    /// [`SpinLockWord::lock_take`].
    pub fn lock_give(&self, a: &SharedArena, cpu: &Cpu, level: LockLevel) {
        // The word must only ever be written through the atomic: a plain
        // store here could race a remote CPU's test-and-set and stomp its
        // freshly written holder marker. Push the posted write out with a
        // read-back instead.
        let word = a.lock_word(self.off);
        word.store(0, Ordering::Release);
        let _ = word.load(Ordering::Acquire);
        cpu.int_unlock(level.0);
    }

    /// Reads the holder marker for diagnostics: 0 when free, `cpu + 1` while
    /// held.
    pub fn holder_marker(&self, a: &SharedArena) -> u32 {
        a.load_u32(self.off)
    }
}
