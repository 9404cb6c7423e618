//! # smk runner
//!
//! Hosts the shared-memory kernel simulation: brings a cluster of simulated
//! processors up on one shared region, then drives cross-processor wakeups
//! and signal delivery from the command line.

#![warn(missing_docs, rustdoc::missing_crate_level_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod cli;
mod logger;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use clap::Parser;
use color_eyre::eyre::eyre;
use kern_util::KiB;
use smk_kernel::{
    prelude::*,
    shared::{event, SmDlList, SmObjInfo, SpinLockWord},
    sig::{self, SIGUSR1, SIGUSR2},
};

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = cli::Cli::parse();
    logger::init(cli.log_level)?;

    match cli.command() {
        cli::Commands::Demo { cpus } => run_demo(cpus)?,
        cli::Commands::Stats => run_stats()?,
    }

    Ok(())
}

/// Rings doorbells by recording them; the poll backoff moonlights as the
/// master's clock so follower attachment sees the heartbeat move.
struct Doorbell {
    arena: Arc<SharedArena>,
    rung: Mutex<Vec<CpuId>>,
}

impl CpuNotify for Doorbell {
    fn notify(&self, dest: CpuId) {
        log::debug!("doorbell rung for cpu {}", dest.0);
        self.rung.lock().unwrap_or_else(|e| e.into_inner()).push(dest);
    }

    fn relax(&self) {
        let _ = heartbeat_tick(&self.arena);
    }
}

/// One region, one master plus `extra` followers, each with its own kernel.
struct Cluster {
    arena: Arc<SharedArena>,
    doorbell: Arc<Doorbell>,
    kernels: Vec<Kernel>,
    /// A shared pend queue carved past the region's own layout, standing in
    /// for a shared semaphore's wait list.
    pend_q: SmPendQ,
    sem_lock: SpinLockWord,
}

impl Cluster {
    fn bring_up(cpus: u32) -> color_eyre::Result<Self> {
        if cpus < 2 {
            return Err(eyre!("the demo needs at least 2 cpus, got {cpus}"));
        }
        let arena = Arc::new(SharedArena::with_capacity(KiB!(64)));
        let params = SmObjParams::builder()
            .max_cpus(cpus)
            .max_tasks(16)
            .build()?;
        let doorbell = Arc::new(Doorbell {
            arena: Arc::clone(&arena),
            rung: Mutex::new(Vec::new()),
        });

        let master_cpu = Arc::new(Cpu::new(CpuId(0)));
        setup(&arena, &master_cpu, &params)?;
        log::info!(
            "region initialized: {} bytes reserved for {} cpus",
            params.req_mem_size(),
            cpus
        );

        let q_off = params.req_mem_size() as u32;
        let sem_lock = SpinLockWord::at(q_off);
        sem_lock.init(&arena);
        let pend_q = SmPendQ::new(sem_lock, SmDlList::at(q_off + 4));

        let mut kernels = Vec::with_capacity(cpus as usize);
        for n in 0..cpus {
            let cpu = if n == 0 {
                Arc::clone(&master_cpu)
            } else {
                Arc::new(Cpu::new(CpuId(n)))
            };
            let polls = if n == 0 {
                params.master_attach_polls()
            } else {
                params.follower_attach_polls()
            };
            let ctx = attach(
                Arc::clone(&arena),
                Arc::clone(&cpu),
                Arc::clone(&doorbell) as Arc<dyn CpuNotify>,
                polls,
            )?;
            if n == 0 {
                GLOBAL_FIFO_Q.init(&ctx, &pend_q)?;
            }
            log::info!("cpu {n} attached");
            let mut kernel = Kernel::new(cpu);
            kernel.attach_shared(ctx);
            kernels.push(kernel);
        }

        Ok(Cluster {
            arena,
            doorbell,
            kernels,
            pend_q,
            sem_lock,
        })
    }

    /// The give side: under the semaphore lock, pop the front waiter and
    /// send the wakeup event to its owner CPU.
    fn give(&mut self) -> color_eyre::Result<bool> {
        let ctx = self.kernels[0]
            .shared()
            .map_err(|e| eyre!("master lost its region handle: {e}"))?
            .clone();
        let level = self
            .sem_lock
            .lock_take(&self.arena, ctx.cpu(), ctx.max_spin_tries())?;
        let locked_head = SmPendQ::new_locked_by_caller(self.pend_q.list());
        let popped = GLOBAL_FIFO_Q.get(&ctx, &locked_head)?;
        self.sem_lock.lock_give(&self.arena, ctx.cpu(), level);

        if let Some(proxy) = popped {
            let owner = proxy.owner_cpu(&self.arena);
            event::event_send_one(&ctx, proxy, owner)?;
        }
        Ok(popped.is_some())
    }

    fn rung(&self) -> Vec<CpuId> {
        self.doorbell
            .rung
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

static USR1_HITS: AtomicUsize = AtomicUsize::new(0);
static LAST_VALUE: AtomicUsize = AtomicUsize::new(0);

fn usr1_handler(signo: u32, info: &SigInfo) {
    USR1_HITS.fetch_add(1, Ordering::SeqCst);
    LAST_VALUE.store(info.value, Ordering::SeqCst);
    log::info!("handler ran for signal {signo} (code {}, value {})", info.code, info.value);
}

fn run_demo(cpus: u32) -> color_eyre::Result<()> {
    let mut cluster = Cluster::bring_up(cpus)?;

    cross_cpu_wake(&mut cluster)?;
    signal_scenarios(&mut cluster.kernels[0])?;

    let ctx = cluster.kernels[0]
        .shared()
        .map_err(|e| eyre!("master lost its region handle: {e}"))?;
    print_info(&ctx.info()?);
    Ok(())
}

/// A task on cpu 1 blocks on the shared pend queue; cpu 0 gives the
/// semaphore and the event layer ferries the wakeup across.
fn cross_cpu_wake(cluster: &mut Cluster) -> color_eyre::Result<()> {
    log::info!("--- cross-processor wakeup ---");

    let pend_q = cluster.pend_q;
    let follower = &mut cluster.kernels[1];
    let waiter = follower.spawn(100);
    follower.resume(waiter);
    follower.pend_current_on(pend_q, PendKey::Fifo, None)?;
    log::info!("cpu 1 task {waiter:?} pended on the shared queue");

    if !cluster.give()? {
        return Err(eyre!("give found no waiter on the shared queue"));
    }
    log::info!("cpu 0 gave; doorbells so far: {:?}", cluster.rung());

    // The doorbell handler runs on the destination CPU.
    event::notify_handler(&mut cluster.kernels[1])?;
    let state = cluster.kernels[1].task_state(waiter);
    let result = cluster.kernels[1].pend_result(waiter);
    log::info!("cpu 1 task {waiter:?} is now {state:?} with pend result {result:?}");
    if result != Some(PendResult::Ok) {
        return Err(eyre!("expected a clean wakeup, got {result:?}"));
    }
    Ok(())
}

/// Exercises the software-signal facility on the master kernel: masking and
/// coalescing, queued payloads, and a timed wait.
fn signal_scenarios(kernel: &mut Kernel) -> color_eyre::Result<()> {
    log::info!("--- signal delivery ---");

    let task = kernel.spawn(50);
    kernel.resume(task);

    let action = SigAction {
        handler: SigHandler::Handler(usr1_handler),
        mask: SigSet::EMPTY,
        flags: Default::default(),
    };
    sig::sigaction(kernel, SIGUSR1, action)?;

    // Blocked raises coalesce into one pending bit.
    sig::sigprocmask(kernel, SigMaskHow::Block, SigSet::of(SIGUSR1))?;
    sig::kill(kernel, task, SIGUSR1)?;
    sig::kill(kernel, task, SIGUSR1)?;
    let pending = sig::sigpending(kernel)?;
    log::info!("two raises while blocked, pending set {pending}");

    // Unblocking delivers synchronously, before sigprocmask returns.
    sig::sigprocmask(kernel, SigMaskHow::Unblock, SigSet::of(SIGUSR1))?;
    log::info!(
        "after unblock the handler ran {} time(s)",
        USR1_HITS.load(Ordering::SeqCst)
    );

    // Queued instances carry their payloads and never coalesce.
    sig::sigprocmask(kernel, SigMaskHow::Block, SigSet::of(SIGUSR1))?;
    sig::sigqueue(kernel, task, SIGUSR1, 7)?;
    sig::sigqueue(kernel, task, SIGUSR1, 8)?;
    sig::sigprocmask(kernel, SigMaskHow::Unblock, SigSet::of(SIGUSR1))?;
    log::info!(
        "queued payloads delivered in order; handler count {}, last value {}",
        USR1_HITS.load(Ordering::SeqCst),
        LAST_VALUE.load(Ordering::SeqCst)
    );

    // A timed wait parks, then a raise wakes it with the winning info.
    match sig::sigtimedwait(kernel, SigSet::of(SIGUSR2), Some(10))? {
        Wait::Ready(info) => log::info!("wait satisfied immediately: {info:?}"),
        Wait::Pending => {
            log::info!("task {task:?} parked in sigtimedwait");
            sig::kill(kernel, task, SIGUSR2)?;
            match kernel.take_wait_result(task) {
                Some(Ok(info)) => log::info!(
                    "wait satisfied by signal {} (code {})",
                    info.signo,
                    info.code
                ),
                other => return Err(eyre!("unexpected wait result {other:?}")),
            }
        }
    }

    Ok(())
}

fn run_stats() -> color_eyre::Result<()> {
    let cluster = Cluster::bring_up(2)?;
    let ctx = cluster.kernels[0]
        .shared()
        .map_err(|e| eyre!("master lost its region handle: {e}"))?;
    print_info(&ctx.info()?);
    Ok(())
}

fn print_info(info: &SmObjInfo) {
    println!("attached cpus : {}", info.attached_cpus);
    println!("heartbeat     : {}", info.heartbeat);
    println!();
    println!(
        "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "partition", "blocks", "blk size", "in use", "free", "lifetime"
    );
    for (name, part) in [
        ("task proxies", &info.tcb_part),
        ("semaphores", &info.sem_part),
        ("msg queues", &info.mq_part),
        ("names", &info.name_part),
        ("user", &info.user_part),
    ] {
        println!(
            "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}",
            name,
            part.total_blocks,
            part.block_size,
            part.cur_allocated,
            part.free_blocks(),
            part.cum_allocated
        );
    }
}
