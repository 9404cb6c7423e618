//! Minimal local task model.
//!
//! Just enough scheduling for the signal facility and the shared-memory
//! layer to hook into: a slot-map task table, a priority ready queue (lower
//! value runs first), pend/delay with tick-driven timeouts, the delete hook
//! chain, and `resume`, which plays the part of the dispatcher granting the
//! CPU back to a task and running any signal trampolines synthesized for it
//! while it was away.
//!
//! Everything here is single-CPU state; the cross-CPU side only ever
//! reaches it through [`Kernel::ready_remote_wake`] and the proxy records
//! in [`crate::shared::fifo`].

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, num::NonZeroU32};

use crossbeam_queue::ArrayQueue;
use kern_util::sync::TicketLock;

use crate::{
    cpu::{Cpu, HostIrq},
    error::{ShareError, SigError},
    shared::{
        event,
        fifo::{PendKey, PendQClass, SharedTcb, SmPendQ, GLOBAL_FIFO_Q},
        obj::SharedObjCtx,
        RemoveOutcome,
    },
    sig::{self, Delivery, SigCtx, SigInfo, SigPool, SigSet},
};

/// Capacity of the deferred event-work queue.
const DEFERRED_WORK_SLOTS: usize = 64;

/// Queued-signal buffers in the default pool.
const DEFAULT_SIG_BUFFERS: usize = 64;

/// Non-zero task handle. The raw value doubles as the proxy back-reference
/// word in shared memory, where zero is the deleted sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(NonZeroU32);

impl TaskId {
    /// The raw wire value.
    pub const fn raw(self) -> u32 {
        self.0.get()
    }

    /// Rebuilds a handle from its wire value; `None` for the deleted
    /// sentinel.
    pub const fn from_raw(raw: u32) -> Option<TaskId> {
        match NonZeroU32::new(raw) {
            Some(n) => Some(TaskId(n)),
            None => None,
        }
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable; on the ready queue or currently dispatched.
    Ready,
    /// Blocked on a wait queue (shared or anonymous local).
    Pended,
    /// Sleeping until a deadline.
    Delayed,
}

/// How the last blocking wait ended. `AlreadyRemoved` surfaces the
/// give-side race from [`RemoveOutcome::AlreadyRemovedByGive`] so dequeue
/// logic knows the remote event now owns the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendResult {
    /// Woken normally.
    Ok,
    /// Deadline expired.
    Timeout,
    /// Unwound so a signal handler can run; retry the operation with the
    /// remaining time from the original deadline.
    Restart,
    /// The task was deleted out of the wait.
    Deleted,
    /// A remote give had already unlinked the wait node; the in-flight
    /// event owns it now.
    AlreadyRemoved,
}

/// One task control block.
pub(crate) struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) priority: u8,
    pub(crate) state: TaskState,
    /// Signal state, created lazily on the first signal-related call.
    pub(crate) sig: Option<SigCtx>,
    /// Cached cross-CPU proxy, allocated on first shared pend and kept for
    /// the life of the task.
    pub(crate) shared_tcb: Option<SharedTcb>,
    /// Queue the task is currently pended on, for the cancel paths.
    pub(crate) pend_q: Option<SmPendQ>,
    pub(crate) pend_result: PendResult,
    /// Outcome slot for the signal-wait family, read after wakeup.
    pub(crate) wait_result: Option<Result<SigInfo, SigError>>,
    /// Handler invocations synthesized while the task was away; run by
    /// `resume`.
    pub(crate) deliveries: Vec<Delivery>,
    /// Mask to reinstate after a suspend-style wait finishes.
    pub(crate) saved_mask: Option<SigSet>,
    pub(crate) deadline: Option<u64>,
}

impl Tcb {
    fn new(id: TaskId, priority: u8) -> Self {
        Tcb {
            id,
            priority,
            state: TaskState::Ready,
            sig: None,
            shared_tcb: None,
            pend_q: None,
            pend_result: PendResult::Ok,
            wait_result: None,
            deliveries: Vec::new(),
            saved_mask: None,
            deadline: None,
        }
    }
}

/// One CPU's kernel: task table, ready queue, clock, signal pool, and the
/// attached shared-region context if any.
pub struct Kernel {
    cpu: Arc<Cpu>,
    sm: Option<SharedObjCtx>,
    tasks: Vec<Option<Tcb>>,
    /// Ready queue, lowest priority value first, FIFO within a priority.
    ready: Vec<TaskId>,
    current: Option<TaskId>,
    now: u64,
    dispatch_depth: u32,
    deferred: ArrayQueue<()>,
    pub(crate) sig_pool: TicketLock<SigPool, HostIrq>,
}

impl Kernel {
    /// A kernel for `cpu` with the default queued-signal pool.
    pub fn new(cpu: Arc<Cpu>) -> Self {
        Self::with_sig_buffers(cpu, DEFAULT_SIG_BUFFERS)
    }

    /// A kernel with `buffers` pre-allocated queued-signal records.
    pub fn with_sig_buffers(cpu: Arc<Cpu>, buffers: usize) -> Self {
        Kernel {
            cpu,
            sm: None,
            tasks: Vec::new(),
            ready: Vec::new(),
            current: None,
            now: 0,
            dispatch_depth: 0,
            deferred: ArrayQueue::new(DEFERRED_WORK_SLOTS),
            sig_pool: TicketLock::new(SigPool::with_buffers(buffers)),
        }
    }

    /// This kernel's CPU descriptor.
    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    /// The current tick count.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Installs the attached shared-region context.
    pub fn attach_shared(&mut self, ctx: SharedObjCtx) {
        self.sm = Some(ctx);
    }

    /// The shared-region context, or [`ShareError::FacilityNotUp`].
    pub fn shared(&self) -> Result<&SharedObjCtx, ShareError> {
        self.sm.as_ref().ok_or(ShareError::FacilityNotUp)
    }

    /// Creates a task, initially ready.
    pub fn spawn(&mut self, priority: u8) -> TaskId {
        let slot = self.tasks.iter().position(Option::is_none);
        let slot = match slot {
            Some(i) => i,
            None => {
                self.tasks.push(None);
                self.tasks.len() - 1
            }
        };
        let id = TaskId(NonZeroU32::MIN.saturating_add(slot as u32));
        self.tasks[slot] = Some(Tcb::new(id, priority));
        self.enqueue_ready(id);
        log::trace!("spawned {id} at priority {priority}");
        id
    }

    pub(crate) fn tcb(&self, id: TaskId) -> Option<&Tcb> {
        self.tasks.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn tcb_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.tasks.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// State of `id`, or `None` for a dead or unknown task.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tcb(id).map(|t| t.state)
    }

    /// How `id`'s last wait ended.
    pub fn pend_result(&self, id: TaskId) -> Option<PendResult> {
        self.tcb(id).map(|t| t.pend_result)
    }

    /// Takes the outcome of `id`'s last signal-family wait, if it finished.
    pub fn take_wait_result(&mut self, id: TaskId) -> Option<Result<SigInfo, SigError>> {
        self.tcb_mut(id).and_then(|t| t.wait_result.take())
    }

    /// The task currently holding the CPU.
    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    /// The current task, or [`SigError::InvalidTask`] when none is
    /// dispatched.
    pub fn current_or_err(&self) -> Result<TaskId, SigError> {
        self.current.ok_or(SigError::InvalidTask)
    }

    fn enqueue_ready(&mut self, id: TaskId) {
        let priority = match self.tcb(id) {
            Some(t) => t.priority,
            None => return,
        };
        let pos = self
            .ready
            .iter()
            .position(|&other| {
                self.tcb(other)
                    .map(|t| t.priority > priority)
                    .unwrap_or(true)
            })
            .unwrap_or(self.ready.len());
        self.ready.insert(pos, id);
    }

    pub(crate) fn make_ready(&mut self, id: TaskId, result: PendResult) {
        let Some(tcb) = self.tcb_mut(id) else { return };
        if tcb.state == TaskState::Ready {
            return;
        }
        tcb.state = TaskState::Ready;
        tcb.pend_q = None;
        tcb.deadline = None;
        tcb.pend_result = result;
        self.enqueue_ready(id);
    }

    /// Wake from a remote CPU's give, delivered through the event layer.
    pub fn ready_remote_wake(&mut self, id: TaskId) {
        match self.task_state(id) {
            Some(TaskState::Pended) => {
                log::trace!("remote wake readies {id}");
                self.make_ready(id, PendResult::Ok);
            }
            // A stale event for a task that already stopped waiting; the
            // remove race resolution guarantees this is a safe no-op.
            _ => log::trace!("remote wake for non-pended {id} ignored"),
        }
    }

    /// Blocks the current task on a shared pend queue.
    ///
    /// Allocates this task's proxy on first use; the proxy stays cached on
    /// the task afterwards. The task leaves the ready queue until woken by
    /// a remote give, a timeout, deletion, or signal restart.
    pub fn pend_current_on(
        &mut self,
        q: SmPendQ,
        key: PendKey,
        timeout: Option<u64>,
    ) -> Result<(), ShareError> {
        let id = self.current.ok_or(ShareError::InvalidRef)?;
        let ctx = self.shared()?.clone();
        let proxy = match self.tcb(id).and_then(|t| t.shared_tcb) {
            Some(p) => p,
            None => {
                let p = SharedTcb::alloc(&ctx, id)?;
                if let Some(tcb) = self.tcb_mut(id) {
                    tcb.shared_tcb = Some(p);
                }
                p
            }
        };
        GLOBAL_FIFO_Q.put(&ctx, &q, proxy, key)?;

        let deadline = timeout.map(|t| self.now + t);
        if let Some(tcb) = self.tcb_mut(id) {
            tcb.state = TaskState::Pended;
            tcb.pend_q = Some(q);
            tcb.deadline = deadline;
        }
        self.leave_cpu(id);
        Ok(())
    }

    /// Blocks the current task on an anonymous local wait (the signal-wait
    /// family).
    pub(crate) fn pend_current_local(&mut self, timeout: Option<u64>) -> Result<TaskId, SigError> {
        let id = self.current_or_err()?;
        let deadline = timeout.map(|t| self.now + t);
        if let Some(tcb) = self.tcb_mut(id) {
            tcb.state = TaskState::Pended;
            tcb.pend_q = None;
            tcb.deadline = deadline;
        }
        self.leave_cpu(id);
        Ok(id)
    }

    /// Puts the current task to sleep for `ticks`.
    pub fn delay_current(&mut self, ticks: u64) {
        let Some(id) = self.current else { return };
        let deadline = self.now + ticks;
        if let Some(tcb) = self.tcb_mut(id) {
            tcb.state = TaskState::Delayed;
            tcb.deadline = Some(deadline);
        }
        self.leave_cpu(id);
    }

    fn leave_cpu(&mut self, id: TaskId) {
        if self.current == Some(id) {
            self.current = None;
        }
        self.ready.retain(|&t| t != id);
    }

    /// Cancels `id`'s membership in its shared wait queue, if any,
    /// resolving the race against a remote give. On
    /// [`RemoveOutcome::AlreadyRemovedByGive`] the task's proxy pointer is
    /// dropped; the in-flight event frees the proxy.
    pub(crate) fn cancel_shared_wait(
        &mut self,
        id: TaskId,
    ) -> Result<Option<RemoveOutcome>, ShareError> {
        let Some(tcb) = self.tcb(id) else {
            return Ok(None);
        };
        let (Some(q), Some(proxy)) = (tcb.pend_q, tcb.shared_tcb) else {
            return Ok(None);
        };
        let ctx = self.shared()?.clone();
        let outcome = GLOBAL_FIFO_Q.remove(&ctx, &q, proxy)?;
        if outcome == RemoveOutcome::AlreadyRemovedByGive {
            if let Some(tcb) = self.tcb_mut(id) {
                tcb.shared_tcb = None;
            }
        }
        Ok(Some(outcome))
    }

    /// Advances the clock one tick and expires deadlines.
    pub fn tick(&mut self) -> Result<(), ShareError> {
        self.now += 1;
        let now = self.now;
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .flatten()
            .filter(|t| {
                matches!(t.state, TaskState::Pended | TaskState::Delayed)
                    && t.deadline.is_some_and(|d| d <= now)
            })
            .map(|t| t.id)
            .collect();

        for id in expired {
            let outcome = self.cancel_shared_wait(id)?;
            sig::wait_timed_out(self, id);
            let result = match outcome {
                Some(RemoveOutcome::AlreadyRemovedByGive) => PendResult::AlreadyRemoved,
                _ => PendResult::Timeout,
            };
            log::trace!("{id} timed out ({result:?})");
            self.make_ready(id, result);
        }
        Ok(())
    }

    /// Deletes `id`, running the teardown hook chain: drain its queued
    /// signals back to the pool, cancel any shared wait, and release or
    /// disown its proxy.
    pub fn delete(&mut self, id: TaskId) -> Result<(), ShareError> {
        if self.tcb(id).is_none() {
            return Ok(());
        }
        sig::task_delete_hook(self, id);

        let outcome = match self.cancel_shared_wait(id) {
            Ok(o) => o,
            Err(err) => {
                log::warn!("delete of {id}: shared wait not cancelled: {err}");
                None
            }
        };
        if outcome != Some(RemoveOutcome::AlreadyRemovedByGive) {
            if let Some(proxy) = self.tcb(id).and_then(|t| t.shared_tcb) {
                let ctx = self.shared()?.clone();
                proxy.mark_task_deleted(ctx.arena());
                if let Err(err) = proxy.release(&ctx) {
                    log::warn!("delete of {id}: task proxy {} not freed: {err}", proxy.gref());
                }
            }
        }

        self.leave_cpu(id);
        self.tasks[id.index()] = None;
        log::trace!("deleted {id}");
        Ok(())
    }

    /// Pops the highest-priority ready task, dispatches it, and runs any
    /// signal trampolines synthesized for it. Returns the task granted the
    /// CPU.
    pub fn schedule_next(&mut self) -> Option<TaskId> {
        if self.ready.is_empty() {
            return None;
        }
        let id = self.ready.remove(0);
        self.resume(id);
        Some(id)
    }

    /// Grants the CPU to `id` and runs its pending signal trampolines, then
    /// drains any event work deferred while dispatching.
    pub fn resume(&mut self, id: TaskId) {
        self.ready.retain(|&t| t != id);
        self.current = Some(id);
        self.dispatch_depth += 1;
        sig::run_deliveries(self, id);
        self.dispatch_depth -= 1;
        if let Err(err) = self.process_deferred() {
            log::warn!("deferred event work failed: {err}");
        }
    }

    /// Whether we are inside a dispatch; the notify handler defers instead
    /// of processing inline when so.
    pub fn in_dispatch(&self) -> bool {
        self.dispatch_depth > 0
    }

    /// Records that spliced event work awaits processing outside the
    /// current dispatch.
    pub fn defer_event_work(&mut self) {
        if self.deferred.push(()).is_err() {
            // Full queue still means "work pending"; a single marker is
            // enough to drain the whole work list.
            log::trace!("deferred-work queue full; marker dropped");
        }
    }

    /// Drains deferred event work.
    pub fn process_deferred(&mut self) -> Result<(), ShareError> {
        while self.deferred.pop().is_some() {
            event::event_process(self)?;
        }
        Ok(())
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.iter().flatten().count()
    }

    #[cfg(test)]
    pub(crate) fn sig_pool_free(&self) -> usize {
        use kern_util::sync::LockCell;
        self.sig_pool.lock().free_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kern_util::types::CpuId;

    fn kernel() -> Kernel {
        Kernel::new(Arc::new(Cpu::new(CpuId(0))))
    }

    #[test]
    fn ready_queue_orders_by_priority_then_fifo() {
        let mut k = kernel();
        let low = k.spawn(200);
        let high = k.spawn(10);
        let mid_a = k.spawn(100);
        let mid_b = k.spawn(100);

        assert_eq!(k.schedule_next(), Some(high));
        assert_eq!(k.schedule_next(), Some(mid_a));
        assert_eq!(k.schedule_next(), Some(mid_b));
        assert_eq!(k.schedule_next(), Some(low));
    }

    #[test]
    fn delay_expires_with_timeout_result() {
        let mut k = kernel();
        let id = k.spawn(100);
        k.resume(id);
        k.delay_current(3);
        assert_eq!(k.task_state(id), Some(TaskState::Delayed));

        k.tick().unwrap();
        k.tick().unwrap();
        assert_eq!(k.task_state(id), Some(TaskState::Delayed));
        k.tick().unwrap();
        assert_eq!(k.task_state(id), Some(TaskState::Ready));
        assert_eq!(k.pend_result(id), Some(PendResult::Timeout));
    }

    #[test]
    fn delete_frees_the_slot() {
        let mut k = kernel();
        let a = k.spawn(100);
        k.delete(a).unwrap();
        assert_eq!(k.task_state(a), None);
        assert_eq!(k.task_count(), 0);
        // The slot is recycled with a fresh id mapping.
        let b = k.spawn(50);
        assert_eq!(b.raw(), a.raw());
    }

    #[test]
    fn task_id_zero_is_the_deleted_sentinel() {
        assert!(TaskId::from_raw(0).is_none());
        let id = TaskId::from_raw(7).unwrap();
        assert_eq!(TaskId::from_raw(id.raw()), Some(id));
    }
}
