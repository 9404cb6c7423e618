//! Task proxies and the global FIFO pend-queue class.
//!
//! A [`SharedTcb`] is a small arena-resident proxy standing in for a local
//! task wherever a remote CPU needs to queue or wake it. Its list node sits
//! at offset 0, so a node reference and a proxy reference are the same
//! [`GlobalRef`].
//!
//! The pend-queue class is the seam between local scheduling and the
//! cross-CPU protocol: local wait primitives talk to a [`SmPendQ`] head
//! through the [`PendQClass`] vtable without knowing the wait list lives in
//! shared memory on some other CPU's semaphore.

use kern_util::types::CpuId;

use crate::{
    error::ShareError,
    shared::{
        arena::{GlobalRef, SharedArena, SmDlList, LIST_NODE_BYTES},
        lock::{LockLevel, SpinLockWord},
        obj::SharedObjCtx,
    },
    task::TaskId,
};

/// Proxy field offsets (bytes from the proxy base). The list node occupies
/// offset 0.
const Q_NODE: u32 = 0;
const LOCAL_TCB: u32 = Q_NODE + LIST_NODE_BYTES;
const OWNER_CPU: u32 = LOCAL_TCB + 4;
const ACTION: u32 = OWNER_CPU + 4;
const REMOVED_BY_GIVE: u32 = ACTION + 4;

/// Size of one proxy block in the task-proxy partition.
pub const SHARED_TCB_BYTES: u32 = 32;

static_assertions::const_assert!(REMOVED_BY_GIVE + 4 <= SHARED_TCB_BYTES);
static_assertions::const_assert_eq!(SHARED_TCB_BYTES % 4, 0);

/// Sentinel stored in `local_tcb` once the backing task is gone. An
/// in-flight wakeup that resolves to this frees the proxy instead of waking
/// anything.
const LOCAL_TCB_DELETED: u32 = 0;

/// What the destination CPU does with a proxy popped off its event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcbAction {
    /// Ready the backing task.
    Wake,
    /// Return the proxy to the partition; the backing task is gone.
    Free,
}

impl TcbAction {
    fn to_u32(self) -> u32 {
        match self {
            TcbAction::Wake => 1,
            TcbAction::Free => 2,
        }
    }

    fn from_u32(raw: u32) -> Result<Self, ShareError> {
        match raw {
            1 => Ok(TcbAction::Wake),
            2 => Ok(TcbAction::Free),
            _ => Err(ShareError::InvalidRef),
        }
    }
}

/// Handle to one task proxy in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedTcb {
    base: GlobalRef,
}

impl SharedTcb {
    /// Wraps an existing proxy reference.
    pub const fn at(base: GlobalRef) -> Self {
        SharedTcb { base }
    }

    /// The proxy's arena reference; also its list-node reference.
    pub const fn gref(self) -> GlobalRef {
        self.base
    }

    /// Allocates a proxy from the task-proxy partition and initializes it
    /// for `task` on the calling CPU.
    pub fn alloc(ctx: &SharedObjCtx, task: TaskId) -> Result<SharedTcb, ShareError> {
        let block =
            ctx.tcb_partition()
                .alloc(ctx.arena(), ctx.cpu(), ctx.max_spin_tries())?;
        let proxy = SharedTcb::at(block);
        let a = ctx.arena();
        a.store_u32(proxy.field(LOCAL_TCB), task.raw());
        a.store_u32(proxy.field(OWNER_CPU), ctx.cpu().id().0);
        a.store_u32(proxy.field(ACTION), TcbAction::Wake.to_u32());
        a.store_u32(proxy.field(REMOVED_BY_GIVE), 0);
        Ok(proxy)
    }

    /// Returns the proxy to the partition. A failure here is logged by the
    /// caller's error path; the block is simply lost if the partition lock
    /// cannot be taken.
    pub fn release(self, ctx: &SharedObjCtx) -> Result<(), ShareError> {
        ctx.tcb_partition()
            .free(ctx.arena(), ctx.cpu(), ctx.max_spin_tries(), self.base)
    }

    const fn field(self, delta: u32) -> u32 {
        self.base.field(delta)
    }

    /// The backing local task, or `None` once the task is gone.
    pub fn local_task(self, a: &SharedArena) -> Option<TaskId> {
        TaskId::from_raw(a.load_u32(self.field(LOCAL_TCB)))
    }

    /// Marks the backing task deleted; an in-flight wakeup will free the
    /// proxy instead.
    pub fn mark_task_deleted(self, a: &SharedArena) {
        a.store_u32(self.field(LOCAL_TCB), LOCAL_TCB_DELETED);
    }

    /// CPU that allocated this proxy.
    pub fn owner_cpu(self, a: &SharedArena) -> CpuId {
        CpuId(a.load_u32(self.field(OWNER_CPU)))
    }

    /// Disposition on event delivery.
    pub fn action(self, a: &SharedArena) -> Result<TcbAction, ShareError> {
        TcbAction::from_u32(a.load_u32(self.field(ACTION)))
    }

    /// Sets the disposition on event delivery.
    pub fn set_action(self, a: &SharedArena, action: TcbAction) {
        a.store_u32(self.field(ACTION), action.to_u32());
    }

    /// Whether the give side already unlinked this proxy from its wait
    /// queue. Meaningful only while the governing lock is held.
    pub fn removed_by_give(self, a: &SharedArena) -> bool {
        a.load_u32(self.field(REMOVED_BY_GIVE)) != 0
    }

    /// Flags or clears the give-side removal marker.
    pub fn set_removed_by_give(self, a: &SharedArena, removed: bool) {
        a.store_u32(self.field(REMOVED_BY_GIVE), removed as u32);
    }
}

/// Where a pend `put` inserts the caller's proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendKey {
    /// Tail insert; first-blocked is first-woken.
    Fifo,
    /// Head insert; supports priority-style wake ordering.
    Priority,
}

/// Result of [`PendQClass::remove`]. Callers must handle both variants;
/// `AlreadyRemovedByGive` means a wakeup event for this proxy is already in
/// flight from the remote CPU and the proxy now belongs to that event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum RemoveOutcome {
    /// The proxy was unlinked here; the caller still owns it.
    Removed,
    /// The give side unlinked it first. The proxy's task back-reference has
    /// been nulled; the in-flight event will free the proxy. The caller
    /// must drop its pointer to the proxy and must not free or wake.
    AlreadyRemovedByGive,
}

/// A pend-queue head: the governing lock (or `None` when the caller's
/// convention is that it already holds the lock) and the wait list itself.
#[derive(Debug, Clone, Copy)]
pub struct SmPendQ {
    lock: Option<SpinLockWord>,
    list: SmDlList,
}

impl SmPendQ {
    /// A head whose operations take `lock` around every list mutation.
    pub const fn new(lock: SpinLockWord, list: SmDlList) -> Self {
        SmPendQ {
            lock: Some(lock),
            list,
        }
    }

    /// A head used by a caller that already holds the governing lock; list
    /// mutations happen bare.
    pub const fn new_locked_by_caller(list: SmDlList) -> Self {
        SmPendQ { lock: None, list }
    }

    /// The wait list.
    pub const fn list(&self) -> SmDlList {
        self.list
    }

    fn take(&self, ctx: &SharedObjCtx) -> Result<Option<LockLevel>, ShareError> {
        match self.lock {
            Some(lock) => Ok(Some(lock.lock_take(
                ctx.arena(),
                ctx.cpu(),
                ctx.max_spin_tries(),
            )?)),
            None => Ok(None),
        }
    }

    fn give(&self, ctx: &SharedObjCtx, level: Option<LockLevel>) {
        if let (Some(lock), Some(level)) = (self.lock, level) {
            lock.lock_give(ctx.arena(), ctx.cpu(), level);
        }
    }
}

/// The pend-queue vtable. One implementation per queue discipline,
/// selected when the owning object is configured.
pub trait PendQClass: Send + Sync {
    /// Initializes the head's wait list.
    fn init(&self, ctx: &SharedObjCtx, q: &SmPendQ) -> Result<(), ShareError>;

    /// Inserts `proxy` per `key`.
    fn put(
        &self,
        ctx: &SharedObjCtx,
        q: &SmPendQ,
        proxy: SharedTcb,
        key: PendKey,
    ) -> Result<(), ShareError>;

    /// Pops the front proxy, if any.
    fn get(&self, ctx: &SharedObjCtx, q: &SmPendQ) -> Result<Option<SharedTcb>, ShareError>;

    /// Unlinks `proxy`, resolving the race against the give side.
    fn remove(
        &self,
        ctx: &SharedObjCtx,
        q: &SmPendQ,
        proxy: SharedTcb,
    ) -> Result<RemoveOutcome, ShareError>;

    /// Number of proxies currently waiting.
    fn count(&self, ctx: &SharedObjCtx, q: &SmPendQ) -> Result<usize, ShareError>;

    /// Calls `f` on each waiting proxy from front to back under the queue
    /// lock, stopping early when `f` returns `false`.
    fn each(
        &self,
        ctx: &SharedObjCtx,
        q: &SmPendQ,
        f: &mut dyn FnMut(SharedTcb) -> bool,
    ) -> Result<(), ShareError>;
}

/// The global first-in-first-out pend-queue class.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalFifoQ;

/// The shared class instance handed out at configuration time.
pub static GLOBAL_FIFO_Q: GlobalFifoQ = GlobalFifoQ;

impl PendQClass for GlobalFifoQ {
    fn init(&self, ctx: &SharedObjCtx, q: &SmPendQ) -> Result<(), ShareError> {
        let level = q.take(ctx)?;
        q.list.init(ctx.arena());
        q.give(ctx, level);
        Ok(())
    }

    fn put(
        &self,
        ctx: &SharedObjCtx,
        q: &SmPendQ,
        proxy: SharedTcb,
        key: PendKey,
    ) -> Result<(), ShareError> {
        let a = ctx.arena();
        let level = q.take(ctx)?;
        proxy.set_removed_by_give(a, false);
        match key {
            PendKey::Fifo => q.list.insert_tail(a, proxy.gref()),
            PendKey::Priority => q.list.insert_head(a, proxy.gref()),
        }
        q.give(ctx, level);
        Ok(())
    }

    fn get(&self, ctx: &SharedObjCtx, q: &SmPendQ) -> Result<Option<SharedTcb>, ShareError> {
        let a = ctx.arena();
        let level = q.take(ctx)?;
        let popped = q.list.pop_head(a).map(SharedTcb::at);
        if let Some(proxy) = popped {
            // Flag the take side while the lock is still held: a concurrent
            // local cancel must see that this proxy already left the queue.
            proxy.set_removed_by_give(a, true);
        }
        q.give(ctx, level);
        Ok(popped)
    }

    fn remove(
        &self,
        ctx: &SharedObjCtx,
        q: &SmPendQ,
        proxy: SharedTcb,
    ) -> Result<RemoveOutcome, ShareError> {
        let a = ctx.arena();
        match q.lock {
            // Give side: it already holds the governing lock. Unlink and
            // flag the take side.
            None => {
                q.list.remove(a, proxy.gref());
                proxy.set_removed_by_give(a, true);
                Ok(RemoveOutcome::Removed)
            }
            // Local cancel (timeout, delete, signal restart): race against
            // the give side under the lock.
            Some(lock) => {
                let level = lock.lock_take(a, ctx.cpu(), ctx.max_spin_tries())?;
                let outcome = if proxy.removed_by_give(a) {
                    // A wakeup event is already in flight; disown the proxy
                    // so the event frees it.
                    proxy.mark_task_deleted(a);
                    RemoveOutcome::AlreadyRemovedByGive
                } else {
                    q.list.remove(a, proxy.gref());
                    RemoveOutcome::Removed
                };
                lock.lock_give(a, ctx.cpu(), level);
                Ok(outcome)
            }
        }
    }

    fn count(&self, ctx: &SharedObjCtx, q: &SmPendQ) -> Result<usize, ShareError> {
        let level = q.take(ctx)?;
        let n = q.list.count(ctx.arena());
        q.give(ctx, level);
        Ok(n)
    }

    fn each(
        &self,
        ctx: &SharedObjCtx,
        q: &SmPendQ,
        f: &mut dyn FnMut(SharedTcb) -> bool,
    ) -> Result<(), ShareError> {
        let level = q.take(ctx)?;
        q.list
            .for_each(ctx.arena(), |node| f(SharedTcb::at(node)));
        q.give(ctx, level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::Cpu,
        shared::obj::{self, tests::PumpNotify, SmObjParams},
    };
    use alloc::sync::Arc;

    /// Full region with one attached CPU, plus a pend queue carved from a
    /// spare arena area past the region.
    fn harness() -> (SharedObjCtx, SmPendQ) {
        let arena = Arc::new(SharedArena::with_capacity(16 * 1024));
        let cpu = Arc::new(Cpu::new(CpuId(0)));
        let notify = Arc::new(PumpNotify::new(Arc::clone(&arena)));
        let params = SmObjParams::builder().max_cpus(1).max_tasks(8).build().unwrap();
        let q_off = params.req_mem_size() as u32;

        obj::setup(&arena, &cpu, &params).unwrap();
        let ctx = obj::attach(arena, cpu, notify, params.master_attach_polls()).unwrap();

        let lock = SpinLockWord::at(q_off);
        lock.init(ctx.arena());
        let q = SmPendQ::new(lock, SmDlList::at(q_off + 4));
        GLOBAL_FIFO_Q.init(&ctx, &q).unwrap();
        (ctx, q)
    }

    fn task(n: u32) -> TaskId {
        TaskId::from_raw(n).unwrap()
    }

    #[test]
    fn fifo_key_wakes_in_block_order() {
        let (ctx, q) = harness();
        let first = SharedTcb::alloc(&ctx, task(1)).unwrap();
        let second = SharedTcb::alloc(&ctx, task(2)).unwrap();
        GLOBAL_FIFO_Q.put(&ctx, &q, first, PendKey::Fifo).unwrap();
        GLOBAL_FIFO_Q.put(&ctx, &q, second, PendKey::Fifo).unwrap();

        assert_eq!(GLOBAL_FIFO_Q.count(&ctx, &q).unwrap(), 2);
        let woken = GLOBAL_FIFO_Q.get(&ctx, &q).unwrap().unwrap();
        assert_eq!(woken, first);
        assert_eq!(woken.local_task(ctx.arena()), Some(task(1)));
    }

    #[test]
    fn each_walks_waiters_front_to_back_with_early_stop() {
        let (ctx, q) = harness();
        for n in 1..=3 {
            let proxy = SharedTcb::alloc(&ctx, task(n)).unwrap();
            GLOBAL_FIFO_Q.put(&ctx, &q, proxy, PendKey::Fifo).unwrap();
        }

        let mut seen = alloc::vec::Vec::new();
        GLOBAL_FIFO_Q
            .each(&ctx, &q, &mut |proxy| {
                seen.push(proxy.local_task(ctx.arena()));
                true
            })
            .unwrap();
        assert_eq!(seen, [Some(task(1)), Some(task(2)), Some(task(3))]);

        // Early stop: only the front waiter is visited.
        let mut visited = 0;
        GLOBAL_FIFO_Q
            .each(&ctx, &q, &mut |_| {
                visited += 1;
                false
            })
            .unwrap();
        assert_eq!(visited, 1);
    }

    #[test]
    fn priority_key_inserts_at_head() {
        let (ctx, q) = harness();
        let low = SharedTcb::alloc(&ctx, task(1)).unwrap();
        let high = SharedTcb::alloc(&ctx, task(2)).unwrap();
        GLOBAL_FIFO_Q.put(&ctx, &q, low, PendKey::Fifo).unwrap();
        GLOBAL_FIFO_Q.put(&ctx, &q, high, PendKey::Priority).unwrap();

        assert_eq!(GLOBAL_FIFO_Q.get(&ctx, &q).unwrap(), Some(high));
        assert_eq!(GLOBAL_FIFO_Q.get(&ctx, &q).unwrap(), Some(low));
    }

    #[test]
    fn local_cancel_first_wins_the_race() {
        let (ctx, q) = harness();
        let proxy = SharedTcb::alloc(&ctx, task(1)).unwrap();
        GLOBAL_FIFO_Q.put(&ctx, &q, proxy, PendKey::Fifo).unwrap();

        // Timeout path runs before any give.
        assert_eq!(
            GLOBAL_FIFO_Q.remove(&ctx, &q, proxy).unwrap(),
            RemoveOutcome::Removed
        );
        assert_eq!(GLOBAL_FIFO_Q.count(&ctx, &q).unwrap(), 0);
        // The caller kept ownership; the back-reference is intact.
        assert_eq!(proxy.local_task(ctx.arena()), Some(task(1)));
    }

    #[test]
    fn remote_give_first_flags_the_local_cancel() {
        let (ctx, q) = harness();
        let proxy = SharedTcb::alloc(&ctx, task(1)).unwrap();
        GLOBAL_FIFO_Q.put(&ctx, &q, proxy, PendKey::Fifo).unwrap();

        // Give side removes under its own lock (locked-by-caller head over
        // the same list).
        let give_side = SmPendQ::new_locked_by_caller(q.list());
        assert_eq!(
            GLOBAL_FIFO_Q.remove(&ctx, &give_side, proxy).unwrap(),
            RemoveOutcome::Removed
        );

        // Local timeout then loses: gets the third outcome, and the proxy
        // is disowned for the in-flight event to free.
        assert_eq!(
            GLOBAL_FIFO_Q.remove(&ctx, &q, proxy).unwrap(),
            RemoveOutcome::AlreadyRemovedByGive
        );
        assert_eq!(proxy.local_task(ctx.arena()), None);
    }

    #[test]
    fn put_rearms_the_give_side_flag() {
        let (ctx, q) = harness();
        let proxy = SharedTcb::alloc(&ctx, task(1)).unwrap();
        proxy.set_removed_by_give(ctx.arena(), true);
        GLOBAL_FIFO_Q.put(&ctx, &q, proxy, PendKey::Fifo).unwrap();
        assert!(!proxy.removed_by_give(ctx.arena()));
    }
}
