//! Error types for the shared-memory object layer and the signal facility.
//!
//! Everything here is an ordinary, recoverable error return. The one
//! out-of-band contract in the whole crate is the spin-lock retry ceiling:
//! configuring it too low for the platform turns remote-CPU stalls into
//! spurious [`ShareError::LockTimeout`]s, and that is a configuration bug,
//! not something callers are expected to handle gracefully.

use kern_util::types::CpuId;
use thiserror::Error;

/// Errors surfaced by the shared-memory object layer.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum ShareError {
    /// A bounded-retry spin lock exhausted its tries. Usually means a remote
    /// CPU is stuck while holding the lock.
    #[error("shared-memory spin lock not acquired within the retry bound")]
    LockTimeout,

    /// A fixed-block partition has no free blocks left.
    #[error("shared partition out of free blocks")]
    OutOfBlocks,

    /// The supplied memory pool cannot hold the requested object counts.
    #[error("shared region too small: need {need} bytes, have {have}")]
    RegionTooSmall {
        /// Bytes required for the requested configuration.
        need: usize,
        /// Bytes actually supplied.
        have: usize,
    },

    /// The configured CPU count exceeds the hard ceiling.
    #[error("requested {requested} CPUs, ceiling is {ceiling}")]
    TooManyCpus {
        /// CPUs requested by the configuration.
        requested: u32,
        /// The compile-time ceiling.
        ceiling: u32,
    },

    /// Setup was attempted by a CPU other than the designated master.
    #[error("shared-region setup attempted on non-master CPU {0}")]
    NotMaster(CpuId),

    /// Setup was attempted on a region that already carries a live layout.
    #[error("shared region already initialized")]
    AlreadyInitialized,

    /// This CPU has already attached; attach is a once-only operation.
    #[error("CPU {0} already attached to the shared region")]
    AlreadyAttached(CpuId),

    /// Attach gave up waiting for the master's setup/heartbeat.
    #[error("shared-memory facility not up (no heartbeat observed)")]
    FacilityNotUp,

    /// Detach was requested; the facility uses a permanent-attachment model
    /// and does not support it.
    #[error("detach not supported; attachment is permanent")]
    NoDetach,

    /// A CPU number outside the configured range was used.
    #[error("invalid CPU number {0}")]
    InvalidCpu(CpuId),

    /// A shared-memory reference was null or outside the arena.
    #[error("invalid shared-memory reference")]
    InvalidRef,

    /// A shared structure failed its verify-tag check (uninitialized or
    /// corrupted memory).
    #[error("shared object failed verification")]
    BadVerify,
}

/// Errors surfaced by the signal facility.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum SigError {
    /// Signal number outside `1..NSIG`.
    #[error("invalid signal number {0}")]
    InvalidSignal(u32),

    /// The task id was null or does not name a live task.
    #[error("invalid task id")]
    InvalidTask,

    /// The global queued-signal buffer pool is empty. The send fails rather
    /// than blocking or growing the pool.
    #[error("queued-signal buffer pool exhausted")]
    NoBuffers,

    /// A signal wait was interrupted by delivery of an unrelated signal.
    #[error("wait interrupted by signal delivery")]
    Interrupted,

    /// A bounded signal wait expired with nothing arriving.
    #[error("signal wait timed out")]
    TimedOut,
}
