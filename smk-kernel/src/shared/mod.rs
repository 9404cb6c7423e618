//! The shared-memory object layer: everything multiple CPUs touch through
//! one common arena.
//!
//! Layered bottom-up: [`arena`] (storage, references, intrusive lists),
//! [`lock`] (bounded-retry spin lock), [`partition`] (fixed-block
//! allocator), [`obj`] (region setup/attach and the per-CPU context),
//! [`event`] (cross-CPU wakeup delivery), [`fifo`] (task proxies and the
//! pend-queue class local scheduling plugs into).

pub mod arena;
pub mod event;
pub mod fifo;
pub mod lock;
pub mod obj;
pub mod partition;

pub use arena::{GlobalRef, SharedArena, SmDlList};
pub use fifo::{PendKey, PendQClass, RemoveOutcome, SharedTcb, SmPendQ, GLOBAL_FIFO_Q};
pub use lock::SpinLockWord;
pub use obj::{CpuNotify, SharedObjCtx, SmObjInfo, SmObjParams};
pub use partition::{PartitionInfo, SmPartition};
