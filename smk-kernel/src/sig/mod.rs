//! The software signal facility.
//!
//! Per-task signal state lives in a lazily created [`SigCtx`]: pending and
//! blocked masks, the coalescing kill-bit mask, a per-signal action vector,
//! and per-signal FIFO queues of payload records drawn from the global
//! [`SigPool`].
//!
//! Delivery has three shapes:
//! - direct call, when the raiser is the target task itself;
//! - a synthesized trampoline pushed onto the target and run the next time
//!   the dispatcher grants it the CPU, with the target unwound out of any
//!   blocking call with a restart status first;
//! - wake-with-info for a task parked in [`sigtimedwait`], which bypasses
//!   handler dispatch entirely.
//!
//! Invariant, checked by the tests after every operation: a signal's
//! pending bit is set iff its kill bit is set or its payload queue is
//! non-empty.

mod pool;

pub use pool::SigPool;
use pool::NIL;

use core::fmt;

use bitflags::bitflags;
use kern_util::sync::LockCell;

use crate::{
    error::SigError,
    task::{Kernel, PendResult, TaskId, TaskState},
};

/// Number of signal slots; valid signal numbers are `1..NSIG`.
pub const NSIG: u32 = 32;

/// Hangup.
pub const SIGHUP: u32 = 1;
/// Interrupt.
pub const SIGINT: u32 = 2;
/// Quit.
pub const SIGQUIT: u32 = 3;
/// Illegal instruction.
pub const SIGILL: u32 = 4;
/// Trace trap.
pub const SIGTRAP: u32 = 5;
/// Abort.
pub const SIGABRT: u32 = 6;
/// Bus error.
pub const SIGBUS: u32 = 7;
/// Arithmetic fault.
pub const SIGFPE: u32 = 8;
/// Kill.
pub const SIGKILL: u32 = 9;
/// User signal 1.
pub const SIGUSR1: u32 = 10;
/// Invalid memory reference.
pub const SIGSEGV: u32 = 11;
/// User signal 2.
pub const SIGUSR2: u32 = 12;
/// Alarm.
pub const SIGALRM: u32 = 14;
/// Termination.
pub const SIGTERM: u32 = 15;

/// `SigInfo::code` for a plain kill-style raise.
pub const SI_KILL: i32 = 0;
/// `SigInfo::code` for a queued send.
pub const SI_QUEUE: i32 = 1;

/// A set of signal numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u64);

impl SigSet {
    /// The empty set.
    pub const EMPTY: SigSet = SigSet(0);

    /// The set holding every valid signal.
    pub const FULL: SigSet = SigSet(((1u64 << NSIG) - 1) & !1);

    /// The set holding exactly `signo`. Out-of-range numbers yield the
    /// empty set.
    pub const fn of(signo: u32) -> SigSet {
        if signo == 0 || signo >= NSIG {
            SigSet(0)
        } else {
            SigSet(1 << signo)
        }
    }

    /// Adds `signo`.
    pub fn add(&mut self, signo: u32) {
        self.0 |= SigSet::of(signo).0;
    }

    /// Removes `signo`.
    pub fn delete(&mut self, signo: u32) {
        self.0 &= !SigSet::of(signo).0;
    }

    /// Whether `signo` is in the set.
    pub const fn member(self, signo: u32) -> bool {
        self.0 & SigSet::of(signo).0 != 0
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Set union.
    pub const fn union(self, other: SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    /// Set difference.
    pub const fn difference(self, other: SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }
}

impl fmt::Display for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

bitflags! {
    /// Per-action behavior flags. Stored and reported; the simulation's
    /// handlers always receive full signal information.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SaFlags: u32 {
        /// Handler expects extended signal information.
        const SIGINFO = 1 << 0;
        /// Interrupted blocking calls are not transparently restarted.
        const INTERRUPT = 1 << 1;
    }
}

/// Disposition of one signal.
#[derive(Debug, Clone, Copy, Default)]
pub enum SigHandler {
    /// No handler installed. Raising is a no-op, same as `Ignore`; a test
    /// pins this down.
    #[default]
    Default,
    /// Explicitly ignored; pending instances are discarded on install.
    Ignore,
    /// Run this handler on delivery.
    Handler(fn(u32, &SigInfo)),
}

/// One slot of the per-task action vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigAction {
    /// What delivery does.
    pub handler: SigHandler,
    /// Extra signals masked while the handler runs.
    pub mask: SigSet,
    /// Behavior flags.
    pub flags: SaFlags,
}

/// Payload delivered with a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigInfo {
    /// The signal number.
    pub signo: u32,
    /// Origin code: [`SI_KILL`], [`SI_QUEUE`], or a raw fault code.
    pub code: i32,
    /// Application value from a queued send; zero otherwise.
    pub value: usize,
}

/// A handler invocation synthesized for a task that was not running when
/// the signal arrived; executed by the dispatcher via
/// [`run_deliveries`].
pub(crate) struct Delivery {
    pub(crate) info: SigInfo,
    pub(crate) action: SigAction,
}

/// Head and tail of one per-signal FIFO chain through the pool.
#[derive(Clone, Copy)]
struct SigQ {
    head: u32,
    tail: u32,
}

impl SigQ {
    const EMPTY: SigQ = SigQ {
        head: NIL,
        tail: NIL,
    };
}

/// In-progress [`sigtimedwait`] descriptor.
struct SigWaitDesc {
    set: SigSet,
}

/// Per-task signal state, created on the first signal-related call.
pub struct SigCtx {
    pending: SigSet,
    blocked: SigSet,
    /// Coalesced non-queued pending signals.
    kilsigs: SigSet,
    vec: [SigAction; NSIG as usize],
    qhead: [SigQ; NSIG as usize],
    wait: Option<SigWaitDesc>,
}

impl SigCtx {
    fn new() -> Self {
        SigCtx {
            pending: SigSet::EMPTY,
            blocked: SigSet::EMPTY,
            kilsigs: SigSet::EMPTY,
            vec: [SigAction::default(); NSIG as usize],
            qhead: [SigQ::EMPTY; NSIG as usize],
            wait: None,
        }
    }

    fn queue_non_empty(&self, signo: u32) -> bool {
        self.qhead[signo as usize].head != NIL
    }

    /// Re-derives `signo`'s pending bit from its kill bit and queue.
    fn recompute_pending(&mut self, signo: u32) {
        if self.kilsigs.member(signo) || self.queue_non_empty(signo) {
            self.pending.add(signo);
        } else {
            self.pending.delete(signo);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_invariant_holds(&self) -> bool {
        (1..NSIG).all(|signo| {
            self.pending.member(signo)
                == (self.kilsigs.member(signo) || self.queue_non_empty(signo))
        })
    }
}

/// A possibly-blocking call: either done now, or the task has left the CPU
/// and the outcome arrives later through [`Kernel::take_wait_result`].
#[must_use]
pub enum Wait<T> {
    /// Finished without blocking.
    Ready(T),
    /// The calling task is now pended.
    Pending,
}

/// How [`sigprocmask`] combines the supplied set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMaskHow {
    /// Union into the blocked set.
    Block,
    /// Remove from the blocked set.
    Unblock,
    /// Replace the blocked set.
    SetMask,
}

/// Architecture fault codes mapped to signals; the final entry is the
/// wildcard default consulted for any unlisted code.
static FAULT_TO_SIG: &[(u32, u32)] = &[
    (0, SIGFPE),   // divide error
    (1, SIGTRAP),  // debug
    (3, SIGTRAP),  // breakpoint
    (4, SIGFPE),   // overflow
    (6, SIGILL),   // invalid opcode
    (12, SIGBUS),  // stack fault
    (13, SIGILL),  // general protection
    (14, SIGSEGV), // page fault
    (17, SIGBUS),  // alignment check
    (u32::MAX, SIGILL),
];

/// Maps a fault code to its signal via the static table.
pub fn fault_signal(code: u32) -> u32 {
    for &(fault, signo) in FAULT_TO_SIG {
        if fault == code || fault == u32::MAX {
            return signo;
        }
    }
    SIGILL
}

fn check_signo(signo: u32) -> Result<(), SigError> {
    if signo == 0 || signo >= NSIG {
        return Err(SigError::InvalidSignal(signo));
    }
    Ok(())
}

fn ensure_ctx(kernel: &mut Kernel, id: TaskId) -> Result<(), SigError> {
    let tcb = kernel.tcb_mut(id).ok_or(SigError::InvalidTask)?;
    if tcb.sig.is_none() {
        tcb.sig = Some(SigCtx::new());
    }
    Ok(())
}

fn ctx_mut(kernel: &mut Kernel, id: TaskId) -> Result<&mut SigCtx, SigError> {
    kernel
        .tcb_mut(id)
        .and_then(|t| t.sig.as_mut())
        .ok_or(SigError::InvalidTask)
}

/// Installs `action` for `signo` on the current task, returning the
/// previous action. Installing `Ignore` discards pending instances.
pub fn sigaction(
    kernel: &mut Kernel,
    signo: u32,
    action: SigAction,
) -> Result<SigAction, SigError> {
    check_signo(signo)?;
    let id = kernel.current_or_err()?;
    ensure_ctx(kernel, id)?;
    let old = {
        let ctx = ctx_mut(kernel, id)?;
        let old = ctx.vec[signo as usize];
        ctx.vec[signo as usize] = action;
        old
    };
    if matches!(action.handler, SigHandler::Ignore) {
        discard_pending(kernel, id, signo)?;
    }
    Ok(old)
}

/// The current task's pending set.
pub fn sigpending(kernel: &mut Kernel) -> Result<SigSet, SigError> {
    let id = kernel.current_or_err()?;
    ensure_ctx(kernel, id)?;
    Ok(ctx_mut(kernel, id)?.pending)
}

/// Adjusts the current task's blocked set, returning the previous set.
///
/// Unblocking a signal that is already pending delivers it synchronously,
/// before this call returns.
pub fn sigprocmask(
    kernel: &mut Kernel,
    how: SigMaskHow,
    set: SigSet,
) -> Result<SigSet, SigError> {
    let id = kernel.current_or_err()?;
    ensure_ctx(kernel, id)?;
    let old = {
        let ctx = ctx_mut(kernel, id)?;
        let old = ctx.blocked;
        ctx.blocked = match how {
            SigMaskHow::Block => old.union(set),
            SigMaskHow::Unblock => old.difference(set),
            SigMaskHow::SetMask => set,
        };
        old
    };
    if how != SigMaskHow::Block {
        drain_deliverable(kernel, id)?;
    }
    Ok(old)
}

/// Raises a non-queued signal against `task`. Repeated raises while blocked
/// coalesce into one pending bit.
pub fn kill(kernel: &mut Kernel, task: TaskId, signo: u32) -> Result<(), SigError> {
    raise_inner(
        kernel,
        task,
        SigInfo {
            signo,
            code: SI_KILL,
            value: 0,
        },
        false,
    )
}

/// Sends a queued signal with an application value. Instances are FIFO and
/// never coalesced; each consumes one pool record while pending.
pub fn sigqueue(
    kernel: &mut Kernel,
    task: TaskId,
    signo: u32,
    value: usize,
) -> Result<(), SigError> {
    raise_inner(
        kernel,
        task,
        SigInfo {
            signo,
            code: SI_QUEUE,
            value,
        },
        true,
    )
}

/// Raises the signal mapped from an architecture fault code against the
/// current (faulting) task; the raw code rides in `SigInfo::code`.
pub fn raise_fault(kernel: &mut Kernel, code: u32) -> Result<(), SigError> {
    let id = kernel.current_or_err()?;
    let signo = fault_signal(code);
    raise_inner(
        kernel,
        id,
        SigInfo {
            signo,
            code: code as i32,
            value: 0,
        },
        false,
    )
}

fn raise_inner(
    kernel: &mut Kernel,
    target: TaskId,
    info: SigInfo,
    queued: bool,
) -> Result<(), SigError> {
    check_signo(info.signo)?;
    ensure_ctx(kernel, target)?;
    let signo = info.signo;

    // A parked sigtimedwait naming this signal wins outright: wake with the
    // info, no handler dispatch, no pending bookkeeping.
    {
        let ctx = ctx_mut(kernel, target)?;
        if ctx.wait.as_ref().is_some_and(|w| w.set.member(signo)) {
            ctx.wait = None;
            if let Some(tcb) = kernel.tcb_mut(target) {
                tcb.wait_result = Some(Ok(info));
            }
            cancel_wait_membership(kernel, target);
            kernel.make_ready(target, PendResult::Ok);
            return Ok(());
        }
    }

    let (action, blocked) = {
        let ctx = ctx_mut(kernel, target)?;
        (ctx.vec[signo as usize], ctx.blocked.member(signo))
    };
    match action.handler {
        // Default raises are a no-op, exactly like Ignore. Pinned by the
        // default_disposition_is_noop test.
        SigHandler::Default | SigHandler::Ignore => return Ok(()),
        SigHandler::Handler(_) => {}
    }

    if blocked {
        record_pending(kernel, target, info, queued)?;
        return Ok(());
    }

    if kernel.current() == Some(target) {
        // Raising at ourselves: plain call-and-return, no frame synthesis.
        invoke(kernel, target, info, action);
        return Ok(());
    }

    // Synthesize the handler invocation on the target; it runs when the
    // dispatcher next grants the target the CPU.
    if let Some(tcb) = kernel.tcb_mut(target) {
        tcb.deliveries.push(Delivery { info, action });
    }
    match kernel.task_state(target) {
        Some(TaskState::Pended) | Some(TaskState::Delayed) => {
            interrupt_sig_wait(kernel, target);
            cancel_wait_membership(kernel, target);
            log::trace!("signal {signo} unwinds {target} with restart");
            kernel.make_ready(target, PendResult::Restart);
        }
        _ => {}
    }
    Ok(())
}

/// Drops the target out of whatever wait queue it occupies, resolving the
/// give-side race; failures here are operational anomalies, logged and
/// otherwise ignored so the raise still lands.
fn cancel_wait_membership(kernel: &mut Kernel, target: TaskId) {
    if let Err(err) = kernel.cancel_shared_wait(target) {
        log::warn!("signal unwind of {target}: shared wait not cancelled: {err}");
    }
}

/// If `target` sits in a signal-family wait, mark that wait interrupted.
fn interrupt_sig_wait(kernel: &mut Kernel, target: TaskId) {
    let in_sig_wait = kernel
        .tcb(target)
        .is_some_and(|t| t.saved_mask.is_some() || t.sig.as_ref().is_some_and(|c| c.wait.is_some()));
    if !in_sig_wait {
        return;
    }
    if let Ok(ctx) = ctx_mut(kernel, target) {
        ctx.wait = None;
    }
    if let Some(tcb) = kernel.tcb_mut(target) {
        tcb.wait_result = Some(Err(SigError::Interrupted));
    }
}

fn record_pending(
    kernel: &mut Kernel,
    target: TaskId,
    info: SigInfo,
    queued: bool,
) -> Result<(), SigError> {
    let signo = info.signo;
    if queued {
        let idx = kernel
            .sig_pool
            .lock()
            .alloc(info)
            .ok_or(SigError::NoBuffers)?;
        let prev_tail = {
            let ctx = ctx_mut(kernel, target)?;
            let q = &mut ctx.qhead[signo as usize];
            let prev = q.tail;
            if q.head == NIL {
                q.head = idx;
            }
            q.tail = idx;
            ctx.recompute_pending(signo);
            prev
        };
        if prev_tail != NIL {
            kernel.sig_pool.lock().set_next(prev_tail, idx);
        }
    } else {
        let ctx = ctx_mut(kernel, target)?;
        ctx.kilsigs.add(signo);
        ctx.recompute_pending(signo);
    }
    Ok(())
}

/// Dequeues one pending instance of `signo`: queued payloads first in FIFO
/// order, then the coalesced kill bit.
fn dequeue_pending(kernel: &mut Kernel, target: TaskId, signo: u32) -> Option<SigInfo> {
    let head = {
        let ctx = ctx_mut(kernel, target).ok()?;
        ctx.qhead[signo as usize].head
    };
    if head != NIL {
        let (info, next) = kernel.sig_pool.lock().take(head);
        if let Ok(ctx) = ctx_mut(kernel, target) {
            let q = &mut ctx.qhead[signo as usize];
            q.head = next;
            if next == NIL {
                q.tail = NIL;
            }
            ctx.recompute_pending(signo);
        }
        return Some(info);
    }
    let ctx = ctx_mut(kernel, target).ok()?;
    if ctx.kilsigs.member(signo) {
        ctx.kilsigs.delete(signo);
        ctx.recompute_pending(signo);
        return Some(SigInfo {
            signo,
            code: SI_KILL,
            value: 0,
        });
    }
    None
}

/// Discards every pending instance of `signo`, returning buffers to the
/// pool.
fn discard_pending(kernel: &mut Kernel, target: TaskId, signo: u32) -> Result<(), SigError> {
    while dequeue_pending(kernel, target, signo).is_some() {}
    Ok(())
}

/// Delivers every pending-and-unblocked signal on `target`, synchronously,
/// in ascending signal order and FIFO within a signal.
fn drain_deliverable(kernel: &mut Kernel, target: TaskId) -> Result<(), SigError> {
    loop {
        let next = {
            let ctx = ctx_mut(kernel, target)?;
            (1..NSIG).find(|&s| ctx.pending.member(s) && !ctx.blocked.member(s))
        };
        let Some(signo) = next else {
            return Ok(());
        };
        let Some(info) = dequeue_pending(kernel, target, signo) else {
            return Ok(());
        };
        let action = ctx_mut(kernel, target)?.vec[signo as usize];
        invoke(kernel, target, info, action);
    }
}

/// Runs one handler with its mask applied, restoring the prior mask after.
fn invoke(kernel: &mut Kernel, target: TaskId, info: SigInfo, action: SigAction) {
    let SigHandler::Handler(handler) = action.handler else {
        return;
    };
    let prev = match ctx_mut(kernel, target) {
        Ok(ctx) => {
            let prev = ctx.blocked;
            ctx.blocked = prev.union(action.mask).union(SigSet::of(info.signo));
            prev
        }
        Err(_) => return,
    };
    handler(info.signo, &info);
    if let Ok(ctx) = ctx_mut(kernel, target) {
        ctx.blocked = prev;
    }
}

/// Replaces the blocked set with `mask` and parks the current task until
/// any signal delivery wakes it.
///
/// There is no successful return: a deliverable signal already pending
/// yields [`SigError::Interrupted`] immediately, and a later wakeup leaves
/// the same error in the task's wait-result slot. The prior mask is
/// reinstated either way.
pub fn sigsuspend(kernel: &mut Kernel, mask: SigSet) -> Result<Wait<()>, SigError> {
    let id = kernel.current_or_err()?;
    ensure_ctx(kernel, id)?;

    let (prev, deliverable_now) = {
        let ctx = ctx_mut(kernel, id)?;
        let prev = ctx.blocked;
        ctx.blocked = mask;
        let deliverable = (1..NSIG).any(|s| ctx.pending.member(s) && !ctx.blocked.member(s));
        (prev, deliverable)
    };

    if deliverable_now {
        drain_deliverable(kernel, id)?;
        ctx_mut(kernel, id)?.blocked = prev;
        return Err(SigError::Interrupted);
    }

    if let Some(tcb) = kernel.tcb_mut(id) {
        tcb.saved_mask = Some(prev);
    }
    kernel.pend_current_local(None)?;
    Ok(Wait::Pending)
}

/// Parks the current task until any signal delivery wakes it; the blocked
/// set is left as is.
pub fn pause(kernel: &mut Kernel) -> Result<Wait<()>, SigError> {
    let id = kernel.current_or_err()?;
    ensure_ctx(kernel, id)?;
    let mask = ctx_mut(kernel, id)?.blocked;
    sigsuspend(kernel, mask)
}

/// Waits for any signal in `set`, bypassing handler dispatch: the winning
/// signal's info is the wait's result, its handler never runs.
///
/// Expiry of `timeout` yields [`SigError::TimedOut`]; delivery of an
/// unrelated unblocked signal yields [`SigError::Interrupted`]. Both
/// surface through the wait-result slot when the call parked.
pub fn sigtimedwait(
    kernel: &mut Kernel,
    set: SigSet,
    timeout: Option<u64>,
) -> Result<Wait<SigInfo>, SigError> {
    let id = kernel.current_or_err()?;
    ensure_ctx(kernel, id)?;

    let already = {
        let ctx = ctx_mut(kernel, id)?;
        (1..NSIG).find(|&s| set.member(s) && ctx.pending.member(s))
    };
    if let Some(signo) = already {
        if let Some(info) = dequeue_pending(kernel, id, signo) {
            return Ok(Wait::Ready(info));
        }
    }

    ctx_mut(kernel, id)?.wait = Some(SigWaitDesc { set });
    kernel.pend_current_local(timeout)?;
    Ok(Wait::Pending)
}

/// Remaining wait time for a restarted blocking call, measured from the
/// original deadline rather than restarted at full duration.
pub fn sig_timeout_recalc(deadline: u64, now: u64) -> u64 {
    deadline.saturating_sub(now)
}

/// Runs the trampolines synthesized for `id` and reinstates a suspended
/// wait's saved mask. Called by the dispatcher when granting `id` the CPU.
pub(crate) fn run_deliveries(kernel: &mut Kernel, id: TaskId) {
    loop {
        let next = kernel.tcb_mut(id).and_then(|t| {
            if t.deliveries.is_empty() {
                None
            } else {
                Some(t.deliveries.remove(0))
            }
        });
        let Some(delivery) = next else { break };
        invoke(kernel, id, delivery.info, delivery.action);
    }

    let saved = kernel.tcb_mut(id).and_then(|t| t.saved_mask.take());
    if let Some(mask) = saved {
        if let Ok(ctx) = ctx_mut(kernel, id) {
            ctx.blocked = mask;
        }
        // Restoring the mask may expose signals that went pending during
        // the suspension window.
        if let Err(err) = drain_deliverable(kernel, id) {
            log::warn!("post-suspend drain for {id} failed: {err}");
        }
    }
}

/// Tick hook: an expired deadline on a task parked in a signal wait turns
/// into the distinguished timeout outcome.
pub(crate) fn wait_timed_out(kernel: &mut Kernel, id: TaskId) {
    let waiting = kernel
        .tcb(id)
        .is_some_and(|t| t.sig.as_ref().is_some_and(|c| c.wait.is_some()));
    if !waiting {
        return;
    }
    if let Ok(ctx) = ctx_mut(kernel, id) {
        ctx.wait = None;
    }
    if let Some(tcb) = kernel.tcb_mut(id) {
        tcb.wait_result = Some(Err(SigError::TimedOut));
    }
}

/// Task-delete hook: drain every queued buffer back to the global pool and
/// drop the signal state.
pub(crate) fn task_delete_hook(kernel: &mut Kernel, id: TaskId) {
    if kernel.tcb(id).map(|t| t.sig.is_some()) != Some(true) {
        return;
    }
    for signo in 1..NSIG {
        while dequeue_pending(kernel, id, signo).is_some() {}
    }
    if let Some(tcb) = kernel.tcb_mut(id) {
        tcb.sig = None;
        tcb.deliveries.clear();
    }
}
