//! Re-export types defined elsewhere for convenience.

use crate::cpu::HostIrq;

pub use kern_util::{
    sync::lock_cell::{LockCell, LockCellGuard},
    types::CpuId,
};

pub use crate::{
    cpu::Cpu,
    error::{ShareError, SigError},
    shared::{
        event::{event_process, event_send, event_send_one, notify_handler},
        obj::{attach, heartbeat_tick, setup},
        CpuNotify, GlobalRef, PendKey, PendQClass, RemoveOutcome, SharedArena, SharedObjCtx,
        SharedTcb, SmObjParams, SmPendQ, GLOBAL_FIFO_Q,
    },
    sig::{SigAction, SigHandler, SigInfo, SigMaskHow, SigSet, Wait},
    task::{Kernel, PendResult, TaskId, TaskState},
};

/// A [`TicketLock`][kern_util::sync::ticket_lock::TicketLock] set up with the
/// host [`InterruptState`][kern_util::sync::InterruptState].
pub type TicketLock<T> = kern_util::sync::ticket_lock::TicketLock<T, HostIrq>;
