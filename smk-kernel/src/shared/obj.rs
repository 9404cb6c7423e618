//! Shared-region setup and attach.
//!
//! The master CPU carves the arena exactly once (`setup`); every CPU,
//! master included, then attaches exactly once (`attach`). There is no
//! detach: remote CPUs may hold references to this CPU's task proxies
//! forever, and without a cross-CPU quiescence protocol teardown cannot be
//! made safe. [`ShareError::NoDetach`] makes that a hard error instead of a
//! silent corruption.
//!
//! Region layout, all offsets in bytes from the arena base:
//!
//! ```text
//! 0                anchor: ready magic (stamped last), header offset
//! ANCHOR_BYTES     header: heartbeat, lock, CPU ceiling, partition offsets
//! header + HDR    per-CPU descriptor table (attached flag, event queue)
//! ...              fixed-block partitions: task proxies, semaphores,
//!                  message queues, names, user blocks
//! ```

use alloc::sync::Arc;
use core::fmt;

use derive_builder::Builder;
use kern_util::types::CpuId;
use thiserror::Error;

use crate::{
    cpu::Cpu,
    error::ShareError,
    shared::{
        arena::{SharedArena, SmDlList, LIST_HEAD_BYTES},
        fifo::SHARED_TCB_BYTES,
        lock::SpinLockWord,
        partition::{PartitionInfo, SmPartition},
    },
};

/// Hard ceiling on the number of CPUs sharing one region.
pub const MAX_CPUS: u32 = 32;

/// Value of the anchor word once the region is live. Polled by `attach`.
const READY_MAGIC: u32 = 0x8AD5_600D;

/// Anchor field offsets.
const READY: u32 = 0;
const HDR_OFF: u32 = 4;
const ANCHOR_BYTES: u32 = 16;

/// Header field offsets, relative to the header base.
const INIT_DONE: u32 = 0;
const HEARTBEAT: u32 = 4;
const HDR_LOCK: u32 = 8;
const HDR_MAX_CPUS: u32 = 12;
const ATTACHED_COUNT: u32 = 16;
const HEARTBEAT_PERIOD: u32 = 20;
const MAX_SPIN_TRIES: u32 = 24;
const TCB_PART: u32 = 28;
const SEM_PART: u32 = 32;
const MQ_PART: u32 = 36;
const NAME_PART: u32 = 40;
const USER_PART: u32 = 44;
const CPU_TABLE: u32 = 48;
const HDR_BYTES: u32 = 56;

/// Per-CPU descriptor field offsets, relative to the descriptor base.
const DESC_ATTACHED: u32 = 0;
const DESC_EVQ_LOCK: u32 = 4;
const DESC_EVQ_LIST: u32 = 8;
const DESC_WORK_LIST: u32 = DESC_EVQ_LIST + LIST_HEAD_BYTES;

/// Size of one per-CPU descriptor.
const CPU_DESC_BYTES: u32 = DESC_WORK_LIST + LIST_HEAD_BYTES;

static_assertions::const_assert_eq!(ANCHOR_BYTES % 4, 0);
static_assertions::const_assert_eq!(HDR_BYTES % 4, 0);
static_assertions::const_assert_eq!(CPU_DESC_BYTES, 24);

/// Block sizes for the carved-but-unused object partitions. Their object
/// logic lives elsewhere; setup only reserves their memory.
const SEM_BLOCK_BYTES: u32 = 32;
const MQ_BLOCK_BYTES: u32 = 64;
const NAME_BLOCK_BYTES: u32 = 40;
const USER_BLOCK_BYTES: u32 = 64;

/// Inter-processor notification capability.
///
/// `notify` rings the destination CPU's doorbell; it is invoked only on the
/// empty-to-non-empty transition of that CPU's event queue. `relax` is the
/// backoff hook inside bounded poll loops; test and runner implementations
/// use it to pump the simulated clock.
pub trait CpuNotify: Send + Sync {
    /// Raise the cross-CPU notification for `dest`.
    fn notify(&self, dest: CpuId);

    /// Called between polls while waiting on a remote CPU.
    fn relax(&self) {}
}

/// Error produced by [`SmObjParamsBuilder::build`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SmObjParamsBuilderError {
    /// A required field was never set.
    #[error("field {0:?} not initialized")]
    UninitializedField(&'static str),

    /// The CPU count exceeds [`MAX_CPUS`].
    #[error("requested {requested} CPUs, ceiling is {ceiling}")]
    TooManyCpus {
        /// CPUs requested.
        requested: u32,
        /// The compile-time ceiling.
        ceiling: u32,
    },

    /// An object count that must be positive was zero.
    #[error("{0} must be non-zero")]
    ZeroCount(&'static str),

    /// The master's attach poll bound must exceed the follower bound.
    #[error("master attach poll bound must exceed the follower bound")]
    AttachPollBounds,
}

impl From<derive_builder::UninitializedFieldError> for SmObjParamsBuilderError {
    fn from(value: derive_builder::UninitializedFieldError) -> Self {
        SmObjParamsBuilderError::UninitializedField(value.field_name())
    }
}

/// Configuration for [`setup`].
///
/// Built via [`SmObjParams::builder`]; validation rejects impossible CPU
/// counts before setup ever touches the arena.
#[derive(Debug, Clone, Builder)]
#[builder(
    no_std,
    pattern = "owned",
    build_fn(validate = "Self::validate", error = "SmObjParamsBuilderError")
)]
pub struct SmObjParams {
    /// Number of CPUs that will share the region. At most [`MAX_CPUS`].
    max_cpus: u32,

    /// Task-proxy blocks to carve. Bounds how many tasks may block on
    /// cross-CPU objects simultaneously.
    #[builder(default = "32")]
    max_tasks: u32,

    /// Shared-semaphore blocks to reserve.
    #[builder(default = "16")]
    max_sems: u32,

    /// Shared message-queue blocks to reserve.
    #[builder(default = "8")]
    max_msg_qs: u32,

    /// Name-database entries to reserve.
    #[builder(default = "16")]
    max_names: u32,

    /// User partition blocks to reserve.
    #[builder(default = "4")]
    max_user_blocks: u32,

    /// Ticks between heartbeat increments, recorded for attachers.
    #[builder(default = "10")]
    heartbeat_period: u32,

    /// Retry bound for every spin lock in the region.
    #[builder(default = "5000")]
    max_spin_tries: u32,

    /// Poll bound for the master's own self-attach.
    #[builder(default = "600")]
    master_attach_polls: u32,

    /// Poll bound for follower attaches.
    #[builder(default = "100")]
    follower_attach_polls: u32,
}

impl SmObjParamsBuilder {
    fn validate(&self) -> Result<(), SmObjParamsBuilderError> {
        if let Some(n) = self.max_cpus {
            if n == 0 {
                return Err(SmObjParamsBuilderError::ZeroCount("max_cpus"));
            }
            if n > MAX_CPUS {
                return Err(SmObjParamsBuilderError::TooManyCpus {
                    requested: n,
                    ceiling: MAX_CPUS,
                });
            }
        }
        for (name, n) in [
            ("max_tasks", self.max_tasks),
            ("max_sems", self.max_sems),
            ("max_msg_qs", self.max_msg_qs),
            ("max_names", self.max_names),
            ("max_user_blocks", self.max_user_blocks),
            ("heartbeat_period", self.heartbeat_period),
            ("max_spin_tries", self.max_spin_tries),
        ] {
            if n == Some(0) {
                return Err(SmObjParamsBuilderError::ZeroCount(name));
            }
        }
        if let (Some(master), Some(follower)) =
            (self.master_attach_polls, self.follower_attach_polls)
        {
            if master <= follower {
                return Err(SmObjParamsBuilderError::AttachPollBounds);
            }
        }
        Ok(())
    }
}

impl SmObjParams {
    /// Creates a [`SmObjParamsBuilder`].
    pub fn builder() -> SmObjParamsBuilder {
        SmObjParamsBuilder::create_empty()
    }

    /// Bytes of arena this configuration needs. Computed before setup
    /// writes anything, so a too-small region fails with no side effects.
    pub fn req_mem_size(&self) -> usize {
        // Summed in u64: each term saturates at u32::MAX, and a sum past
        // any real arena's length fails setup with `RegionTooSmall` rather
        // than wrapping into a plausible-looking size.
        let parts = SmPartition::bytes_for(self.max_tasks, SHARED_TCB_BYTES) as u64
            + SmPartition::bytes_for(self.max_sems, SEM_BLOCK_BYTES) as u64
            + SmPartition::bytes_for(self.max_msg_qs, MQ_BLOCK_BYTES) as u64
            + SmPartition::bytes_for(self.max_names, NAME_BLOCK_BYTES) as u64
            + SmPartition::bytes_for(self.max_user_blocks, USER_BLOCK_BYTES) as u64;
        let cpus = self.max_cpus as u64 * CPU_DESC_BYTES as u64;
        ((ANCHOR_BYTES + HDR_BYTES) as u64 + cpus + parts) as usize
    }

    /// Retry bound for the region's spin locks.
    pub fn max_spin_tries(&self) -> u32 {
        self.max_spin_tries
    }

    /// Poll bound for the master's self-attach.
    pub fn master_attach_polls(&self) -> u32 {
        self.master_attach_polls
    }

    /// Poll bound for follower attaches.
    pub fn follower_attach_polls(&self) -> u32 {
        self.follower_attach_polls
    }
}

/// Per-CPU descriptor handle: the attached flag and this CPU's event queue.
#[derive(Debug, Clone, Copy)]
pub struct CpuDesc {
    base: u32,
}

impl CpuDesc {
    fn field(&self, delta: u32) -> u32 {
        self.base + delta
    }

    /// Whether this CPU has attached.
    pub fn is_attached(&self, a: &SharedArena) -> bool {
        a.load_u32(self.field(DESC_ATTACHED)) != 0
    }

    /// The lock guarding this CPU's event queue.
    pub fn evq_lock(&self) -> SpinLockWord {
        SpinLockWord::at(self.field(DESC_EVQ_LOCK))
    }

    /// This CPU's event queue of task proxies awaiting wakeup.
    pub fn evq_list(&self) -> SmDlList {
        SmDlList::at(self.field(DESC_EVQ_LIST))
    }

    /// Landing area the notify handler splices the event queue into before
    /// processing; only ever touched by the owning CPU.
    pub fn work_list(&self) -> SmDlList {
        SmDlList::at(self.field(DESC_WORK_LIST))
    }
}

/// Aggregate statistics over the shared region.
#[derive(Debug, Clone, Copy)]
pub struct SmObjInfo {
    /// CPUs attached so far.
    pub attached_cpus: u32,
    /// Current heartbeat counter value.
    pub heartbeat: u32,
    /// Task-proxy partition statistics.
    pub tcb_part: PartitionInfo,
    /// Semaphore partition statistics.
    pub sem_part: PartitionInfo,
    /// Message-queue partition statistics.
    pub mq_part: PartitionInfo,
    /// Name-database partition statistics.
    pub name_part: PartitionInfo,
    /// User partition statistics.
    pub user_part: PartitionInfo,
}

/// Per-CPU handle to the attached shared region.
///
/// Created by [`attach`], cloned freely; every cross-CPU operation takes it
/// explicitly, replacing the globals the facility would otherwise need.
#[derive(Clone)]
pub struct SharedObjCtx {
    arena: Arc<SharedArena>,
    cpu: Arc<Cpu>,
    notify: Arc<dyn CpuNotify>,
    hdr: u32,
    max_cpus: u32,
    max_spin_tries: u32,
    tcb_part: SmPartition,
    sem_part: SmPartition,
    mq_part: SmPartition,
    name_part: SmPartition,
    user_part: SmPartition,
}

impl fmt::Debug for SharedObjCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedObjCtx")
            .field("cpu", &self.cpu.id())
            .field("hdr", &self.hdr)
            .field("max_cpus", &self.max_cpus)
            .field("max_spin_tries", &self.max_spin_tries)
            .finish_non_exhaustive()
    }
}

impl SharedObjCtx {
    /// The shared arena.
    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    /// This CPU's descriptor.
    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    /// The inter-processor notification capability.
    pub fn notify(&self) -> &Arc<dyn CpuNotify> {
        &self.notify
    }

    /// Retry bound for the region's spin locks.
    pub fn max_spin_tries(&self) -> u32 {
        self.max_spin_tries
    }

    /// The task-proxy partition.
    pub fn tcb_partition(&self) -> &SmPartition {
        &self.tcb_part
    }

    /// Descriptor of `cpu`, which must be below the configured CPU count.
    pub fn cpu_desc(&self, cpu: CpuId) -> Result<CpuDesc, ShareError> {
        if cpu.0 >= self.max_cpus {
            return Err(ShareError::InvalidCpu(cpu));
        }
        Ok(CpuDesc {
            base: self.hdr + CPU_TABLE + cpu.0 * CPU_DESC_BYTES,
        })
    }

    /// Descriptor of the attaching CPU itself.
    pub fn own_desc(&self) -> CpuDesc {
        CpuDesc {
            base: self.hdr + CPU_TABLE + self.cpu.id().0 * CPU_DESC_BYTES,
        }
    }

    /// Current heartbeat counter value.
    pub fn heartbeat(&self) -> u32 {
        self.arena.load_u32(self.hdr + HEARTBEAT)
    }

    /// Number of CPUs attached so far.
    pub fn attached_count(&self) -> u32 {
        self.arena.load_u32(self.hdr + ATTACHED_COUNT)
    }

    /// Detach is unsupported; attachment is permanent.
    pub fn detach(&self) -> Result<(), ShareError> {
        Err(ShareError::NoDetach)
    }

    /// Statistics snapshot over the whole region.
    pub fn info(&self) -> Result<SmObjInfo, ShareError> {
        Ok(SmObjInfo {
            attached_cpus: self.attached_count(),
            heartbeat: self.heartbeat(),
            tcb_part: self.tcb_part.info(&self.arena)?,
            sem_part: self.sem_part.info(&self.arena)?,
            mq_part: self.mq_part.info(&self.arena)?,
            name_part: self.name_part.info(&self.arena)?,
            user_part: self.user_part.info(&self.arena)?,
        })
    }
}

/// Carves the shared region. Master CPU only, exactly once.
///
/// The required size is computed before anything is written, so a
/// [`ShareError::RegionTooSmall`] failure leaves the arena untouched and a
/// retry over a larger arena is safe.
pub fn setup(a: &SharedArena, cpu: &Cpu, params: &SmObjParams) -> Result<(), ShareError> {
    if !cpu.id().is_master() {
        return Err(ShareError::NotMaster(cpu.id()));
    }
    if params.max_cpus > MAX_CPUS {
        return Err(ShareError::TooManyCpus {
            requested: params.max_cpus,
            ceiling: MAX_CPUS,
        });
    }
    if a.load_u32(READY) == READY_MAGIC {
        return Err(ShareError::AlreadyInitialized);
    }
    let need = params.req_mem_size();
    if need > a.len() {
        return Err(ShareError::RegionTooSmall {
            need,
            have: a.len(),
        });
    }

    // Clear everything we are about to carve; the region may be recycled
    // memory with stale contents.
    let mut off = 0;
    while (off as usize) < need {
        a.store_u32(off, 0);
        off += 4;
    }

    let hdr = ANCHOR_BYTES;
    a.store_u32(hdr + HDR_MAX_CPUS, params.max_cpus);
    a.store_u32(hdr + HEARTBEAT_PERIOD, params.heartbeat_period);
    a.store_u32(hdr + MAX_SPIN_TRIES, params.max_spin_tries);
    SpinLockWord::at(hdr + HDR_LOCK).init(a);

    for i in 0..params.max_cpus {
        let desc = CpuDesc {
            base: hdr + CPU_TABLE + i * CPU_DESC_BYTES,
        };
        a.store_u32(desc.field(DESC_ATTACHED), 0);
        desc.evq_lock().init(a);
        desc.evq_list().init(a);
        desc.work_list().init(a);
    }

    let mut cursor = hdr + HDR_BYTES + params.max_cpus * CPU_DESC_BYTES;
    let mut carve = |field: u32, blocks: u32, block_size: u32| -> Result<(), ShareError> {
        let size = SmPartition::bytes_for(blocks, block_size);
        SmPartition::init(a, cursor, size, block_size)?;
        a.store_u32(hdr + field, cursor);
        cursor += size;
        Ok(())
    };
    carve(TCB_PART, params.max_tasks, SHARED_TCB_BYTES)?;
    carve(SEM_PART, params.max_sems, SEM_BLOCK_BYTES)?;
    carve(MQ_PART, params.max_msg_qs, MQ_BLOCK_BYTES)?;
    carve(NAME_PART, params.max_names, NAME_BLOCK_BYTES)?;
    carve(USER_PART, params.max_user_blocks, USER_BLOCK_BYTES)?;

    a.store_u32(hdr + HEARTBEAT, 1);
    a.store_u32(hdr + INIT_DONE, 1);

    // Publish last. Attachers poll the anchor; every store above has
    // already been forced out by its read-back.
    a.store_u32(HDR_OFF, hdr);
    a.store_u32(READY, READY_MAGIC);

    log::debug!(
        "shared region up: {need} bytes, {} CPUs, {} task proxies",
        params.max_cpus,
        params.max_tasks
    );
    Ok(())
}

/// Increments the region heartbeat. Driven by whoever owns the master's
/// clock; attachers read the counter, never write it.
pub fn heartbeat_tick(a: &SharedArena) -> Result<u32, ShareError> {
    if a.load_u32(READY) != READY_MAGIC {
        return Err(ShareError::FacilityNotUp);
    }
    let hdr = a.load_u32(HDR_OFF);
    let next = a.load_u32(hdr + HEARTBEAT).wrapping_add(1);
    a.store_u32(hdr + HEARTBEAT, next);
    Ok(next)
}

/// Attaches `cpu` to the shared region. Once per CPU, no detach.
///
/// Polls the anchor for readiness and then for heartbeat movement, calling
/// `notify.relax()` between polls, up to `max_polls` total. A region that
/// never comes ready, or whose heartbeat is frozen, is reported as
/// [`ShareError::FacilityNotUp`].
pub fn attach(
    arena: Arc<SharedArena>,
    cpu: Arc<Cpu>,
    notify: Arc<dyn CpuNotify>,
    max_polls: u32,
) -> Result<SharedObjCtx, ShareError> {
    let a = &*arena;
    let mut polls = max_polls;

    loop {
        if a.load_u32(READY) == READY_MAGIC {
            break;
        }
        if polls == 0 {
            return Err(ShareError::FacilityNotUp);
        }
        polls -= 1;
        notify.relax();
    }

    let hdr = a.load_u32(HDR_OFF);
    let first = a.load_u32(hdr + HEARTBEAT);
    loop {
        if a.load_u32(hdr + HEARTBEAT) != first {
            break;
        }
        if polls == 0 {
            return Err(ShareError::FacilityNotUp);
        }
        polls -= 1;
        notify.relax();
    }

    let max_cpus = a.load_u32(hdr + HDR_MAX_CPUS);
    if cpu.id().0 >= max_cpus {
        return Err(ShareError::InvalidCpu(cpu.id()));
    }
    let max_spin_tries = a.load_u32(hdr + MAX_SPIN_TRIES);
    let desc = CpuDesc {
        base: hdr + CPU_TABLE + cpu.id().0 * CPU_DESC_BYTES,
    };

    // Attached flag and count change together under the header lock.
    let hdr_lock = SpinLockWord::at(hdr + HDR_LOCK);
    let level = hdr_lock.lock_take(a, &cpu, max_spin_tries)?;
    if a.load_u32(desc.field(DESC_ATTACHED)) != 0 {
        hdr_lock.lock_give(a, &cpu, level);
        return Err(ShareError::AlreadyAttached(cpu.id()));
    }
    a.store_u32(desc.field(DESC_ATTACHED), 1);
    a.store_u32(
        hdr + ATTACHED_COUNT,
        a.load_u32(hdr + ATTACHED_COUNT) + 1,
    );
    hdr_lock.lock_give(a, &cpu, level);

    let part = |field: u32| SmPartition::attach(a, a.load_u32(hdr + field));
    let ctx = SharedObjCtx {
        tcb_part: part(TCB_PART)?,
        sem_part: part(SEM_PART)?,
        mq_part: part(MQ_PART)?,
        name_part: part(NAME_PART)?,
        user_part: part(USER_PART)?,
        arena,
        cpu,
        notify,
        hdr,
        max_cpus,
        max_spin_tries,
    };
    log::debug!("CPU {} attached to shared region", ctx.cpu.id());
    Ok(ctx)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Pumps the heartbeat from the poll backoff, standing in for the
    /// master's clock; counts doorbells per destination CPU.
    pub(crate) struct PumpNotify {
        arena: Arc<SharedArena>,
        pub doorbells: std::sync::Mutex<Vec<CpuId>>,
    }

    impl PumpNotify {
        pub(crate) fn new(arena: Arc<SharedArena>) -> Self {
            Self {
                arena,
                doorbells: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl CpuNotify for PumpNotify {
        fn notify(&self, dest: CpuId) {
            self.doorbells.lock().unwrap().push(dest);
        }

        fn relax(&self) {
            let _ = heartbeat_tick(&self.arena);
        }
    }

    fn params(max_cpus: u32) -> SmObjParams {
        SmObjParams::builder()
            .max_cpus(max_cpus)
            .max_tasks(8)
            .max_sems(2)
            .max_msg_qs(2)
            .max_names(2)
            .max_user_blocks(1)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_rejects_cpu_count_over_ceiling() {
        let err = SmObjParams::builder()
            .max_cpus(MAX_CPUS + 1)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SmObjParamsBuilderError::TooManyCpus {
                requested: MAX_CPUS + 1,
                ceiling: MAX_CPUS
            }
        );
        assert!(matches!(
            SmObjParams::builder().max_cpus(0).build(),
            Err(SmObjParamsBuilderError::ZeroCount("max_cpus"))
        ));
    }

    #[test]
    fn too_small_region_fails_with_no_partial_writes() {
        let arena = SharedArena::with_capacity(256);
        let cpu = Cpu::new(CpuId(0));
        let p = params(2);
        assert!(p.req_mem_size() > arena.len());

        assert!(matches!(
            setup(&arena, &cpu, &p),
            Err(ShareError::RegionTooSmall { .. })
        ));
        // Nothing was written; an attacher still sees a dead region.
        for off in (0..arena.len() as u32).step_by(4) {
            assert_eq!(arena.load_u32(off), 0);
        }
    }

    #[test]
    fn absurd_block_counts_saturate_instead_of_wrapping() {
        // max_tasks * block size overflows u32; the size computation must
        // saturate so setup reports the region too small, not carve short.
        let p = SmObjParams::builder()
            .max_cpus(1)
            .max_tasks(u32::MAX / 2)
            .build()
            .unwrap();
        assert!(p.req_mem_size() >= u32::MAX as usize);

        let arena = SharedArena::with_capacity(4096);
        let cpu = Cpu::new(CpuId(0));
        assert!(matches!(
            setup(&arena, &cpu, &p),
            Err(ShareError::RegionTooSmall { .. })
        ));
        for off in (0..arena.len() as u32).step_by(4) {
            assert_eq!(arena.load_u32(off), 0);
        }
    }

    #[test]
    fn setup_is_master_only_and_once_only() {
        let arena = SharedArena::with_capacity(8192);
        let p = params(2);

        assert_eq!(
            setup(&arena, &Cpu::new(CpuId(1)), &p).unwrap_err(),
            ShareError::NotMaster(CpuId(1))
        );
        setup(&arena, &Cpu::new(CpuId(0)), &p).unwrap();
        assert_eq!(
            setup(&arena, &Cpu::new(CpuId(0)), &p).unwrap_err(),
            ShareError::AlreadyInitialized
        );
    }

    #[test]
    fn attach_before_setup_reports_facility_not_up() {
        let arena = Arc::new(SharedArena::with_capacity(1024));
        let notify = Arc::new(PumpNotify::new(Arc::clone(&arena)));
        let err = attach(arena, Arc::new(Cpu::new(CpuId(0))), notify, 50).unwrap_err();
        assert_eq!(err, ShareError::FacilityNotUp);
    }

    #[test]
    fn master_and_follower_attach_once_each() {
        let arena = Arc::new(SharedArena::with_capacity(8192));
        let master = Arc::new(Cpu::new(CpuId(0)));
        let follower = Arc::new(Cpu::new(CpuId(1)));
        let notify: Arc<dyn CpuNotify> = Arc::new(PumpNotify::new(Arc::clone(&arena)));
        let p = params(2);

        setup(&arena, &master, &p).unwrap();
        let m = attach(
            Arc::clone(&arena),
            Arc::clone(&master),
            Arc::clone(&notify),
            p.master_attach_polls(),
        )
        .unwrap();
        assert_eq!(m.attached_count(), 1);

        let f = attach(
            Arc::clone(&arena),
            Arc::clone(&follower),
            Arc::clone(&notify),
            p.follower_attach_polls(),
        )
        .unwrap();
        assert_eq!(f.attached_count(), 2);
        assert!(f.own_desc().is_attached(f.arena()));

        assert_eq!(
            attach(arena, follower, notify, p.follower_attach_polls()).unwrap_err(),
            ShareError::AlreadyAttached(CpuId(1))
        );
    }

    #[test]
    fn attach_rejects_cpu_outside_configured_range() {
        let arena = Arc::new(SharedArena::with_capacity(8192));
        let notify: Arc<dyn CpuNotify> = Arc::new(PumpNotify::new(Arc::clone(&arena)));
        setup(&arena, &Cpu::new(CpuId(0)), &params(2)).unwrap();

        let err = attach(arena, Arc::new(Cpu::new(CpuId(5))), notify, 50).unwrap_err();
        assert_eq!(err, ShareError::InvalidCpu(CpuId(5)));
    }

    #[test]
    fn detach_is_a_hard_error() {
        let arena = Arc::new(SharedArena::with_capacity(8192));
        let master = Arc::new(Cpu::new(CpuId(0)));
        let notify: Arc<dyn CpuNotify> = Arc::new(PumpNotify::new(Arc::clone(&arena)));
        setup(&arena, &master, &params(1)).unwrap();
        let ctx = attach(arena, master, notify, 600).unwrap();
        assert_eq!(ctx.detach().unwrap_err(), ShareError::NoDetach);
    }
}
