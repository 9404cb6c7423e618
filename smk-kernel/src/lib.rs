//! # `smk-kernel` -- cross-CPU synchronization and signal delivery core.
//!
//! Two tightly coupled subsystems: the shared-memory object layer
//! ([`shared`]: arena, bounded spin locks, fixed-block partitions, region
//! setup/attach, cross-CPU event wakeups, the FIFO pend-queue class) and
//! the per-task software signal facility ([`sig`]). The small task model in
//! [`task`] is the local-scheduler surface both of them hook into.
//!
//! The crate is hosted-testable: hardware seams (test-and-set, interrupt
//! masking, inter-processor notification, the clock) are explicit types and
//! capability traits, so every cross-CPU interleaving can be driven
//! deterministically from a test or the runner binary.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cpu;
pub mod error;
pub mod prelude;
pub mod shared;
pub mod sig;
pub mod task;

pub use error::{ShareError, SigError};
