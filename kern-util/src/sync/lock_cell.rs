//! Provides the [`LockCell`] trait, which is a cell type that provides
//! synchronized dynamic mutation using interior mutability and locks.

use core::{
    fmt::Display,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

/// A trait representing a lock cell that guards simultaneous access to a value.
pub trait LockCell<T>
where
    Self: LockCellInternal<T> + Send + Sync,
{
    /// Get access to the value of this lock. Blocks until access is granted.
    fn lock(&self) -> LockCellGuard<'_, T, Self>;

    /// Attempt to acquire a lock without blocking.
    ///
    /// If the lock could not be acquired at this time, then `None` is returned.
    fn try_lock(&self) -> Option<LockCellGuard<'_, T, Self>>;
}

/// Unsafe internals used by the [`LockCell`]s and the [`LockCellGuard`].
///
/// Normally this shouldn't be used unless if you're implementing a [`LockCell`].
pub trait LockCellInternal<T> {
    /// Returns a reference to the data behind a mutex.
    ///
    /// # Safety
    /// The current thread must have ownership of the lock.
    unsafe fn get(&self) -> &T;

    /// Returns a mutable reference to the data behind a mutex.
    ///
    /// # Safety
    /// The current thread must have ownership of the lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn get_mut(&self) -> &mut T;

    /// Unlock the mutex.
    ///
    /// # Safety
    /// This should only be called when the [`LockCellGuard`] corresponding to
    /// this [`LockCell`] is dropped.
    unsafe fn unlock<'s, 'l: 's>(&'s self, guard: &mut LockCellGuard<'l, T, Self>);

    /// Returns `true` if the LockCell is currently unlocked.
    ///
    /// NOTE: The caller can't rely on this fact, since some other
    /// core/interrupt etc could take the lock during or right after this call
    /// finishes.
    fn is_unlocked(&self) -> bool;
}

/// A RAII lock guard that takes care of unlocking its associated lock when
/// dropped.
///
/// This allows safe access to the value inside of a [`LockCell`]. When this is
/// dropped, the [`LockCell`] is unlocked again.
///
/// This can be obtained from [`LockCell::lock`].
#[derive(Debug)]
pub struct LockCellGuard<'l, T, M>
where
    M: ?Sized + LockCellInternal<T>,
{
    /// The [`LockCell`] that is guarded by `self`.
    pub(super) lockcell: &'l M,
    /// Keeps the guard `!Send`/`!Sync`: lock ownership stays on the acquiring
    /// execution context.
    pub(super) _phantom: PhantomData<(*mut (), T)>,
}

impl<'l, T, M> LockCellGuard<'l, T, M>
where
    M: ?Sized + LockCellInternal<T>,
{
    /// Create a new guard. This should only be called if you're implementing a
    /// [`LockCell`].
    ///
    /// # Safety
    /// The caller must ensure that only 1 [`LockCellGuard`] exists for any
    /// given [`LockCell`] at a time.
    pub unsafe fn new(lockcell: &'l M) -> Self {
        LockCellGuard {
            lockcell,
            _phantom: PhantomData,
        }
    }
}

impl<'l, T, M> Deref for LockCellGuard<'l, T, M>
where
    M: ?Sized + LockCellInternal<T>,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: There will always only be 1 guard for a given mutex, so this
        // is safe.
        unsafe { self.lockcell.get() }
    }
}

impl<'l, T, M> DerefMut for LockCellGuard<'l, T, M>
where
    M: ?Sized + LockCellInternal<T>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: There will always only be 1 guard for a given mutex, so this
        // is safe.
        unsafe { self.lockcell.get_mut() }
    }
}

impl<'l, T, M> AsRef<T> for LockCellGuard<'l, T, M>
where
    M: ?Sized + LockCellInternal<T>,
{
    fn as_ref(&self) -> &T {
        self
    }
}

impl<'l, T, M> AsMut<T> for LockCellGuard<'l, T, M>
where
    M: ?Sized + LockCellInternal<T>,
{
    fn as_mut(&mut self) -> &mut T {
        self
    }
}

impl<'l, T, M> Display for LockCellGuard<'l, T, M>
where
    T: Display,
    M: ?Sized + LockCellInternal<T>,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        (**self).fmt(f)
    }
}

impl<T, M: ?Sized + LockCellInternal<T>> Drop for LockCellGuard<'_, T, M> {
    fn drop(&mut self) {
        unsafe { self.lockcell.unlock(self) }
    }
}
