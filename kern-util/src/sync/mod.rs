//! Synchronization primitives for *local* (same-CPU) kernel state.
//!
//! Cross-CPU locking over the shared arena is a different animal (bounded
//! retry, no fairness guarantees from remote CPUs) and lives with the
//! shared-memory layer; the primitives here protect state that is only ever
//! touched by tasks and interrupt handlers of a single CPU.

pub mod lock_cell;
pub mod ticket_lock;

pub use lock_cell::{LockCell, LockCellGuard};
pub use ticket_lock::TicketLock;

/// Trait that allows access to OS-level constructs defining interrupt state
/// and enter/exit critical-section primitives (for interrupt disabling and
/// enabling).
pub trait InterruptState: 'static {
    /// Returns `true` if we're currently in an interrupt handler.
    fn in_interrupt() -> bool;

    /// Signal the kernel that a critical section was entered (e.g. a lock was
    /// taken).
    ///
    /// If `disable_interrupts` is true, the lock does not support being
    /// interrupted and interrupts must therefore be disabled. This is also a
    /// prerequisite for a lock to be taken within an interrupt.
    ///
    /// # Safety
    /// - Caller must call [`InterruptState::exit_critical_section()`] exactly
    ///   once with the same parameter passed for `disable_interrupts`.
    unsafe fn enter_critical_section(disable_interrupts: bool);

    /// Signal the kernel that a critical section was exited (e.g. a lock was
    /// released).
    ///
    /// # Safety
    /// - The caller must ensure that this function is called exactly once per
    ///   invocation of [`InterruptState::enter_critical_section()`] with the
    ///   same parameter as passed to this function.
    unsafe fn exit_critical_section(enable_interrupts: bool);
}

/// An [`InterruptState`] for hosts without interrupt delivery.
///
/// Critical sections collapse to nothing; mutual exclusion still comes from
/// the lock itself. Used by simulations and unit tests.
pub struct NoIrq;

impl InterruptState for NoIrq {
    fn in_interrupt() -> bool {
        false
    }

    unsafe fn enter_critical_section(_disable_interrupts: bool) {}

    unsafe fn exit_critical_section(_enable_interrupts: bool) {}
}
