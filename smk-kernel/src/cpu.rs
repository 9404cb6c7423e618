//! Local per-CPU state.
//!
//! A [`Cpu`] is the local descriptor of one processor in the cluster: its
//! number and its interrupt-mask nesting depth. The shared-memory spin lock
//! raises the local interrupt level for the duration of a critical section
//! and hands the caller an opaque [`IntLevel`] token to restore it with;
//! nesting is tracked with a counter so paired raise/restore calls compose.

use core::sync::atomic::{AtomicU32, Ordering};

use kern_util::{sync::InterruptState, types::CpuId};

/// Local descriptor of one CPU.
#[derive(Debug)]
pub struct Cpu {
    id: CpuId,
    /// Current interrupt-mask nesting depth. Zero means interrupts are open.
    int_depth: AtomicU32,
}

/// Opaque token recording the interrupt level before a critical section, to
/// be passed back when the section ends.
#[derive(Debug)]
#[must_use = "dropping an IntLevel leaves interrupts masked"]
pub struct IntLevel(u32);

impl Cpu {
    /// Creates the local descriptor for CPU `id`, with interrupts open.
    pub const fn new(id: CpuId) -> Self {
        Cpu {
            id,
            int_depth: AtomicU32::new(0),
        }
    }

    /// This CPU's cluster-wide number.
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Masks local interrupts/preemption, returning the token for the paired
    /// [`Cpu::int_unlock`].
    pub fn int_lock(&self) -> IntLevel {
        let prev = self.int_depth.fetch_add(1, Ordering::SeqCst);
        IntLevel(prev)
    }

    /// Restores the interrupt level recorded by [`Cpu::int_lock`].
    pub fn int_unlock(&self, level: IntLevel) {
        let now = self.int_depth.fetch_sub(1, Ordering::SeqCst);
        debug_assert_eq!(now, level.0 + 1, "unbalanced interrupt lock nesting");
    }

    /// Returns `true` if interrupts are currently masked on this CPU.
    pub fn ints_masked(&self) -> bool {
        self.int_depth.load(Ordering::SeqCst) > 0
    }
}

/// [`InterruptState`] implementation for the hosted simulation.
///
/// The simulated platform has no asynchronous interrupt delivery, so the
/// critical-section hooks are no-ops; mutual exclusion comes entirely from
/// the locks themselves.
pub struct HostIrq;

impl InterruptState for HostIrq {
    fn in_interrupt() -> bool {
        false
    }

    unsafe fn enter_critical_section(_disable_interrupts: bool) {}

    unsafe fn exit_critical_section(_enable_interrupts: bool) {}
}
