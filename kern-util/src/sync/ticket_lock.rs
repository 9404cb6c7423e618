//! A [ticket lock](https://en.wikipedia.org/wiki/Ticket_lock), which is a form
//! of spinlock with better fairness but higher uncontended latency.
//!
//! [`TicketLock`] is a [`LockCell`] implementation, that can be both
//! preemptable or not depending on how it is created ([`TicketLock::new`] vs
//! [`TicketLock::new_non_preemptable`]).

use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

use super::{
    lock_cell::{LockCell, LockCellGuard, LockCellInternal},
    InterruptState,
};

/// A [ticket lock](https://en.wikipedia.org/wiki/Ticket_lock) implementation
/// for [`LockCell`].
///
/// - `T` is the type of data stored in the lock.
/// - `I` gives access to the CPU's interrupt state.
#[derive(Debug)]
pub struct TicketLock<T, I> {
    /// The current ticket that can access the lock.
    current_ticket: AtomicU64,
    /// The next ticket to give out.
    next_ticket: AtomicU64,
    /// The data held by the lock. We use [`UnsafeCell`] because we manually
    /// manage access to the data, respecting Rust's rules.
    data: UnsafeCell<T>,
    /// `true` if the lock is *not* usable in interrupts.
    pub preemptable: bool,
    /// Act like we own access to the CPU's interrupt state.
    _interrupt_state: PhantomData<I>,
}

unsafe impl<T: Send, I: InterruptState> Send for TicketLock<T, I> {}
unsafe impl<T: Send, I: InterruptState> Sync for TicketLock<T, I> {}

impl<T, I> TicketLock<T, I> {
    /// Creates a new [`TicketLock`].
    pub const fn new(data: T) -> Self {
        Self {
            current_ticket: AtomicU64::new(0),
            next_ticket: AtomicU64::new(0),
            data: UnsafeCell::new(data),
            preemptable: true,
            _interrupt_state: PhantomData,
        }
    }

    /// Creates a new __non-preemptable__ [`TicketLock`].
    ///
    /// This assumes that it is safe to disable interrupts while the lock is
    /// held.
    pub const fn new_non_preemptable(data: T) -> Self {
        Self {
            current_ticket: AtomicU64::new(0),
            next_ticket: AtomicU64::new(0),
            data: UnsafeCell::new(data),
            preemptable: false,
            _interrupt_state: PhantomData,
        }
    }

    /// Returns a mutable reference to the underlying data without locking.
    ///
    /// `&mut self` guarantees exclusive access at compile time, so no lock is
    /// needed. Useful during single-threaded initialization.
    pub fn get_mut_unlocked(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Send, I: InterruptState> LockCell<T> for TicketLock<T, I> {
    #[track_caller]
    fn lock(&self) -> LockCellGuard<'_, T, Self> {
        assert!(
            !self.preemptable || !I::in_interrupt(),
            "cannot use preemptable TicketLock in interrupt"
        );

        unsafe {
            // Safety: disabling interrupts is ok, for non-preemptable locks
            I::enter_critical_section(!self.preemptable);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);

        while self.current_ticket.load(Ordering::SeqCst) != ticket {
            spin_loop();
        }

        // Safety: we hold the ticket being served, so we are the unique owner.
        unsafe { LockCellGuard::new(self) }
    }

    #[track_caller]
    fn try_lock(&self) -> Option<LockCellGuard<'_, T, Self>> {
        unsafe {
            // Safety: matched by the exit in unlock or the failure arm below.
            I::enter_critical_section(!self.preemptable);
        }

        let ticket = self.current_ticket.load(Ordering::SeqCst);
        match self.next_ticket.compare_exchange(
            ticket,
            ticket.wrapping_add(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            // Safety: we took the only outstanding ticket, so we own the lock.
            Ok(_) => Some(unsafe { LockCellGuard::new(self) }),
            Err(_) => {
                unsafe {
                    // Safety: the matching enter is right above.
                    I::exit_critical_section(!self.preemptable);
                }
                None
            }
        }
    }
}

impl<T, I: InterruptState> LockCellInternal<T> for TicketLock<T, I> {
    unsafe fn get(&self) -> &T {
        unsafe { &*self.data.get() }
    }

    unsafe fn get_mut(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }

    unsafe fn unlock<'s, 'l: 's>(&'s self, guard: &mut LockCellGuard<'l, T, Self>) {
        assert!(
            core::ptr::eq(self, guard.lockcell),
            "attempted to use a LockCellGuard to unlock a TicketLock that doesn't actually own the TicketLock"
        );

        self.current_ticket.fetch_add(1, Ordering::SeqCst);

        // Safety: this will restore the interrupt state from when we called
        // enter_critical_section, so this is safe
        unsafe {
            I::exit_critical_section(!self.preemptable);
        }
    }

    fn is_unlocked(&self) -> bool {
        let current = self.current_ticket.load(Ordering::SeqCst);
        let next = self.next_ticket.load(Ordering::SeqCst);
        current == next
    }
}

impl<T: Default, I> Default for TicketLock<T, I> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::NoIrq;

    #[test]
    fn lock_serializes_mutation() {
        let lock: TicketLock<u64, NoIrq> = TicketLock::new(0);
        for _ in 0..100 {
            *lock.lock() += 1;
        }
        assert_eq!(*lock.lock(), 100);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock: TicketLock<(), NoIrq> = TicketLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn is_unlocked_tracks_guard_lifetime() {
        let lock: TicketLock<u8, NoIrq> = TicketLock::new(7);
        assert!(lock.is_unlocked());
        let guard = lock.lock();
        assert!(!lock.is_unlocked());
        drop(guard);
        assert!(lock.is_unlocked());
    }
}
