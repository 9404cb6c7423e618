//! Common type definitions.

use core::{
    fmt,
    ops::{Deref, DerefMut},
};

/// Contains the number of a CPU participating in the shared-memory cluster.
///
/// CPU numbers are assigned by configuration, not discovered; CPU 0 is always
/// the master that performs the one-time shared-region setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub u32);

// CpuId is stored raw in shared-memory structures; it must stay word-sized.
static_assertions::const_assert_eq!(core::mem::size_of::<CpuId>(), 4);

impl CpuId {
    /// Whether this CPU is the designated master, responsible for the
    /// one-time setup of all globally shared structures.
    pub const fn is_master(&self) -> bool {
        self.0 == 0
    }
}

impl Deref for CpuId {
    type Target = u32;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for CpuId {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<u32> for CpuId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<CpuId> for u32 {
    fn from(val: CpuId) -> Self {
        val.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
