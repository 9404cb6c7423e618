//! Two-kernel simulations of the cross-CPU wakeup protocol: a task on one
//! CPU blocks on a shared pend queue, the other CPU gives, and the event
//! layer carries the wakeup across. Includes both orderings of the
//! give-versus-local-cancel race.

use std::sync::{Arc, Mutex};

use smk_kernel::{
    prelude::*,
    shared::{event, SmDlList, SpinLockWord},
};

/// Counts doorbells per destination and pumps the heartbeat from the poll
/// backoff, playing the master's clock.
struct Doorbell {
    arena: Arc<SharedArena>,
    rung: Mutex<Vec<CpuId>>,
}

impl CpuNotify for Doorbell {
    fn notify(&self, dest: CpuId) {
        self.rung.lock().unwrap().push(dest);
    }

    fn relax(&self) {
        let _ = heartbeat_tick(&self.arena);
    }
}

struct Cluster {
    master: Kernel,
    follower: Kernel,
    doorbell: Arc<Doorbell>,
    /// A shared pend queue (its lock word and wait list) carved past the
    /// region, standing in for a shared semaphore.
    pend_q: SmPendQ,
    sem_lock: SpinLockWord,
}

impl Cluster {
    fn new() -> Self {
        let arena = Arc::new(SharedArena::with_capacity(32 * 1024));
        let params = SmObjParams::builder()
            .max_cpus(2)
            .max_tasks(8)
            .build()
            .unwrap();
        let doorbell = Arc::new(Doorbell {
            arena: Arc::clone(&arena),
            rung: Mutex::new(Vec::new()),
        });

        let cpu0 = Arc::new(Cpu::new(CpuId(0)));
        let cpu1 = Arc::new(Cpu::new(CpuId(1)));
        setup(&arena, &cpu0, &params).unwrap();
        let ctx0 = attach(
            Arc::clone(&arena),
            Arc::clone(&cpu0),
            Arc::clone(&doorbell) as Arc<dyn CpuNotify>,
            params.master_attach_polls(),
        )
        .unwrap();
        let ctx1 = attach(
            Arc::clone(&arena),
            Arc::clone(&cpu1),
            Arc::clone(&doorbell) as Arc<dyn CpuNotify>,
            params.follower_attach_polls(),
        )
        .unwrap();

        let q_off = params.req_mem_size() as u32;
        let sem_lock = SpinLockWord::at(q_off);
        sem_lock.init(&arena);
        let pend_q = SmPendQ::new(sem_lock, SmDlList::at(q_off + 4));

        let mut master = Kernel::new(cpu0);
        master.attach_shared(ctx0.clone());
        GLOBAL_FIFO_Q.init(&ctx0, &pend_q).unwrap();

        let mut follower = Kernel::new(cpu1);
        follower.attach_shared(ctx1);

        Cluster {
            master,
            follower,
            doorbell,
            pend_q,
            sem_lock,
        }
    }

    /// Blocks a fresh follower task on the shared pend queue.
    fn pend_follower_task(&mut self, timeout: Option<u64>) -> TaskId {
        let id = self.follower.spawn(100);
        self.follower.resume(id);
        self.follower
            .pend_current_on(self.pend_q, PendKey::Fifo, timeout)
            .unwrap();
        assert_eq!(self.follower.task_state(id), Some(TaskState::Pended));
        id
    }

    /// The give side, run on the master: under the semaphore lock, pop the
    /// front waiter and send the wakeup event to its owner CPU.
    fn give(&mut self) -> Option<SharedTcb> {
        let ctx = self.master.shared().unwrap().clone();
        let a = ctx.arena();
        let level = self
            .sem_lock
            .lock_take(a, ctx.cpu(), ctx.max_spin_tries())
            .unwrap();
        let locked_head = SmPendQ::new_locked_by_caller(self.pend_q.list());
        let popped = GLOBAL_FIFO_Q.get(&ctx, &locked_head).unwrap();
        self.sem_lock.lock_give(a, ctx.cpu(), level);

        if let Some(proxy) = popped {
            let owner = proxy.owner_cpu(a);
            event::event_send_one(&ctx, proxy, owner).unwrap();
        }
        popped
    }

    fn doorbells(&self) -> Vec<CpuId> {
        self.doorbell.rung.lock().unwrap().clone()
    }
}

#[test]
fn give_wakes_the_remote_pender() {
    let mut c = Cluster::new();
    let id = c.pend_follower_task(None);

    assert!(c.give().is_some());
    assert_eq!(c.doorbells(), vec![CpuId(1)]);

    // The doorbell handler runs on the follower.
    event::notify_handler(&mut c.follower).unwrap();
    assert_eq!(c.follower.task_state(id), Some(TaskState::Ready));
    assert_eq!(c.follower.pend_result(id), Some(PendResult::Ok));
}

#[test]
fn doorbell_is_edge_triggered_across_gives() {
    let mut c = Cluster::new();
    let a_task = c.pend_follower_task(None);
    let b_task = c.pend_follower_task(None);

    // Two gives while the follower has not processed: one doorbell.
    c.give().unwrap();
    c.give().unwrap();
    assert_eq!(c.doorbells(), vec![CpuId(1)]);

    event::notify_handler(&mut c.follower).unwrap();
    assert_eq!(c.follower.task_state(a_task), Some(TaskState::Ready));
    assert_eq!(c.follower.task_state(b_task), Some(TaskState::Ready));

    // Queue drained; the next give rings again.
    let c_task = c.pend_follower_task(None);
    c.give().unwrap();
    assert_eq!(c.doorbells(), vec![CpuId(1), CpuId(1)]);
    event::notify_handler(&mut c.follower).unwrap();
    assert_eq!(c.follower.task_state(c_task), Some(TaskState::Ready));
}

#[test]
fn give_then_local_timeout_wakes_exactly_once() {
    let mut c = Cluster::new();
    let id = c.pend_follower_task(Some(3));
    let proxies_before = {
        let ctx = c.follower.shared().unwrap();
        ctx.tcb_partition().info(ctx.arena()).unwrap().cur_allocated
    };

    // The give lands first but its event sits unprocessed while the
    // follower's clock expires the wait.
    c.give().unwrap();
    for _ in 0..3 {
        c.follower.tick().unwrap();
    }
    // The local cancel lost the race: third outcome, proxy disowned.
    assert_eq!(c.follower.task_state(id), Some(TaskState::Ready));
    assert_eq!(c.follower.pend_result(id), Some(PendResult::AlreadyRemoved));

    // The in-flight event frees the proxy instead of double-waking.
    event::notify_handler(&mut c.follower).unwrap();
    assert_eq!(c.follower.task_state(id), Some(TaskState::Ready));
    assert_eq!(c.follower.pend_result(id), Some(PendResult::AlreadyRemoved));
    let proxies_after = {
        let ctx = c.follower.shared().unwrap();
        ctx.tcb_partition().info(ctx.arena()).unwrap().cur_allocated
    };
    assert_eq!(proxies_after, proxies_before - 1);
}

#[test]
fn local_timeout_then_give_finds_no_waiter() {
    let mut c = Cluster::new();
    let id = c.pend_follower_task(Some(2));

    for _ in 0..2 {
        c.follower.tick().unwrap();
    }
    assert_eq!(c.follower.pend_result(id), Some(PendResult::Timeout));

    // The waiter is gone from the queue; the give wakes nobody and rings
    // nothing.
    assert!(c.give().is_none());
    assert!(c.doorbells().is_empty());
}

#[test]
fn deferred_event_work_drains_on_next_process() {
    let mut c = Cluster::new();
    let id = c.pend_follower_task(None);
    c.give().unwrap();

    // Mimic a doorbell landing mid-dispatch: splice to the work list, then
    // defer instead of processing inline.
    {
        let ctx = c.follower.shared().unwrap().clone();
        let a = ctx.arena();
        let desc = ctx.own_desc();
        let level = desc
            .evq_lock()
            .lock_take(a, ctx.cpu(), ctx.max_spin_tries())
            .unwrap();
        desc.evq_list().concat_into(a, &desc.work_list());
        desc.evq_lock().lock_give(a, ctx.cpu(), level);
    }
    c.follower.defer_event_work();
    assert_eq!(c.follower.task_state(id), Some(TaskState::Pended));

    c.follower.process_deferred().unwrap();
    assert_eq!(c.follower.task_state(id), Some(TaskState::Ready));
    assert_eq!(c.follower.pend_result(id), Some(PendResult::Ok));
}

#[test]
fn deleting_a_pended_task_releases_its_proxy() {
    let mut c = Cluster::new();
    let id = c.pend_follower_task(None);
    let ctx = c.follower.shared().unwrap().clone();
    assert_eq!(ctx.tcb_partition().info(ctx.arena()).unwrap().cur_allocated, 1);

    c.follower.delete(id).unwrap();
    assert_eq!(ctx.tcb_partition().info(ctx.arena()).unwrap().cur_allocated, 0);
    assert_eq!(GLOBAL_FIFO_Q.count(&ctx, &c.pend_q).unwrap(), 0);
}

#[test]
fn region_statistics_reflect_the_cluster() {
    let c = Cluster::new();
    let info = c.master.shared().unwrap().info().unwrap();
    assert_eq!(info.attached_cpus, 2);
    assert!(info.heartbeat >= 1);
    assert_eq!(info.tcb_part.total_blocks, 8);
    assert_eq!(info.tcb_part.cur_allocated, 0);
}

#[test]
fn setup_too_small_is_retryable_on_a_larger_region() {
    let params = SmObjParams::builder().max_cpus(2).build().unwrap();
    let cpu = Arc::new(Cpu::new(CpuId(0)));

    let small = SharedArena::with_capacity(128);
    assert!(matches!(
        setup(&small, &cpu, &params),
        Err(ShareError::RegionTooSmall { .. })
    ));

    let large = Arc::new(SharedArena::with_capacity(64 * 1024));
    setup(&large, &cpu, &params).unwrap();
    let doorbell = Arc::new(Doorbell {
        arena: Arc::clone(&large),
        rung: Mutex::new(Vec::new()),
    });
    let ctx = attach(large, cpu, doorbell, params.master_attach_polls()).unwrap();
    assert_eq!(ctx.attached_count(), 1);
}
