//! Cross-CPU event delivery.
//!
//! A wakeup travels as a task proxy spliced onto the destination CPU's event
//! queue. The inter-processor doorbell fires only on the queue's
//! empty-to-non-empty transition; losing that edge is a silent deadlock, so
//! the emptiness check happens under the queue lock, never outside it.

use kern_util::types::CpuId;

use crate::{
    error::ShareError,
    shared::{
        arena::SmDlList,
        fifo::{SharedTcb, TcbAction},
        obj::SharedObjCtx,
    },
    task::Kernel,
};

/// Splices `src` onto `dest`'s event queue and rings the doorbell iff the
/// queue went empty to non-empty.
pub fn event_send(ctx: &SharedObjCtx, src: &SmDlList, dest: CpuId) -> Result<(), ShareError> {
    let a = ctx.arena();
    if src.is_empty(a) {
        return Ok(());
    }
    let desc = ctx.cpu_desc(dest)?;
    let level = desc
        .evq_lock()
        .lock_take(a, ctx.cpu(), ctx.max_spin_tries())?;
    let was_empty = desc.evq_list().is_empty(a);
    src.concat_into(a, &desc.evq_list());
    desc.evq_lock().lock_give(a, ctx.cpu(), level);

    if was_empty {
        ctx.notify().notify(dest);
    }
    Ok(())
}

/// Queues a single proxy for wakeup on `dest`. Same edge-triggered doorbell
/// discipline as [`event_send`].
pub fn event_send_one(
    ctx: &SharedObjCtx,
    proxy: SharedTcb,
    dest: CpuId,
) -> Result<(), ShareError> {
    let a = ctx.arena();
    let desc = ctx.cpu_desc(dest)?;
    let level = desc
        .evq_lock()
        .lock_take(a, ctx.cpu(), ctx.max_spin_tries())?;
    let was_empty = desc.evq_list().is_empty(a);
    desc.evq_list().insert_tail(a, proxy.gref());
    desc.evq_lock().lock_give(a, ctx.cpu(), level);

    if was_empty {
        ctx.notify().notify(dest);
    }
    Ok(())
}

/// Drains this CPU's work list, one proxy per short masked section.
///
/// A proxy whose backing task is gone, or whose action says free, goes back
/// to the partition; everything else readies the backing task. This is the
/// resolution point of the remote-wake versus local-cancel race: by the
/// time a proxy reaches here, the loser has either nulled the back-reference
/// or observed `AlreadyRemovedByGive`, so exactly one side acts.
pub fn event_process(kernel: &mut Kernel) -> Result<(), ShareError> {
    let ctx = kernel.shared()?.clone();
    let a = ctx.arena();
    let work = ctx.own_desc().work_list();

    loop {
        let level = ctx.cpu().int_lock();
        let node = work.pop_head(a);
        ctx.cpu().int_unlock(level);
        let Some(node) = node else {
            return Ok(());
        };

        let proxy = SharedTcb::at(node);
        match (proxy.local_task(a), proxy.action(a)?) {
            (None, _) | (_, TcbAction::Free) => {
                if let Err(err) = proxy.release(&ctx) {
                    log::warn!("task proxy {} not freed: {err}", proxy.gref());
                }
            }
            (Some(task), TcbAction::Wake) => {
                proxy.set_removed_by_give(a, false);
                kernel.ready_remote_wake(task);
            }
        }
    }
}

/// The doorbell handler on the destination CPU.
///
/// Splices the entire event queue onto this CPU's private work list under
/// the queue lock, then processes it inline, or defers to the kernel's work
/// queue when already inside a dispatch so the handler stays short.
pub fn notify_handler(kernel: &mut Kernel) -> Result<(), ShareError> {
    let ctx = kernel.shared()?.clone();
    let a = ctx.arena();
    let desc = ctx.own_desc();
    if desc.evq_list().is_empty(a) {
        return Ok(());
    }

    let level = desc
        .evq_lock()
        .lock_take(a, ctx.cpu(), ctx.max_spin_tries())?;
    desc.evq_list().concat_into(a, &desc.work_list());
    desc.evq_lock().lock_give(a, ctx.cpu(), level);

    if kernel.in_dispatch() {
        kernel.defer_event_work();
        Ok(())
    } else {
        event_process(kernel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::Cpu,
        shared::{
            arena::SharedArena,
            obj::{self, tests::PumpNotify, SmObjParams},
        },
        task::TaskId,
    };
    use alloc::sync::Arc;

    fn attached_ctx() -> (SharedObjCtx, Arc<PumpNotify>) {
        let arena = Arc::new(SharedArena::with_capacity(16 * 1024));
        let cpu = Arc::new(Cpu::new(CpuId(0)));
        let notify = Arc::new(PumpNotify::new(Arc::clone(&arena)));
        let params = SmObjParams::builder().max_cpus(2).max_tasks(8).build().unwrap();
        obj::setup(&arena, &cpu, &params).unwrap();
        let ctx = obj::attach(
            arena,
            cpu,
            Arc::clone(&notify) as Arc<dyn obj::CpuNotify>,
            params.master_attach_polls(),
        )
        .unwrap();
        (ctx, notify)
    }

    #[test]
    fn doorbell_rings_only_on_the_empty_edge() {
        let (ctx, notify) = attached_ctx();
        let dest = CpuId(1);
        let first = SharedTcb::alloc(&ctx, TaskId::from_raw(1).unwrap()).unwrap();
        let second = SharedTcb::alloc(&ctx, TaskId::from_raw(2).unwrap()).unwrap();

        event_send_one(&ctx, first, dest).unwrap();
        // Queue still non-empty: no second doorbell.
        event_send_one(&ctx, second, dest).unwrap();

        assert_eq!(notify.doorbells.lock().unwrap().as_slice(), &[dest]);
        assert_eq!(ctx.cpu_desc(dest).unwrap().evq_list().count(ctx.arena()), 2);
    }

    #[test]
    fn splicing_an_empty_list_neither_locks_nor_rings() {
        let (ctx, notify) = attached_ctx();
        let params_scratch = ctx.arena().len() as u32 - 64;
        let src = SmDlList::at(params_scratch);
        src.init(ctx.arena());

        event_send(&ctx, &src, CpuId(1)).unwrap();
        assert!(notify.doorbells.lock().unwrap().is_empty());
    }

    #[test]
    fn sending_to_an_unconfigured_cpu_is_an_error() {
        let (ctx, _notify) = attached_ctx();
        let proxy = SharedTcb::alloc(&ctx, TaskId::from_raw(1).unwrap()).unwrap();
        assert_eq!(
            event_send_one(&ctx, proxy, CpuId(9)).unwrap_err(),
            ShareError::InvalidCpu(CpuId(9))
        );
    }
}
