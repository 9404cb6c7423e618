//! Fixed-block partitions: lock-protected free-list allocators carved out of
//! the shared arena.
//!
//! A partition serves exactly one block size. Free blocks carry no header;
//! the first 8 bytes of an unallocated block double as its free-list node,
//! and once allocated those bytes belong entirely to the caller. Nothing is
//! validated when a block is freed -- handing back a block that was never
//! allocated from the partition corrupts the free list, and that contract
//! sits with the caller, exactly like the allocator this models.

use kern_util::types::CpuId;

use crate::{
    cpu::Cpu,
    error::ShareError,
    shared::{
        arena::{GlobalRef, SharedArena, SmDlList, LIST_HEAD_BYTES, LIST_NODE_BYTES},
        lock::SpinLockWord,
    },
};

/// Object-type discriminant stamped into every partition header.
pub const OBJ_TYPE_PARTITION: u32 = 0x5061_7274;

/// XOR tag mixed with the partition's own offset to form the `verify` word.
const VERIFY_TAG: u32 = 0x5EED_B10C;

/// Partition header field offsets (bytes from the partition base).
const VERIFY: u32 = 0;
const OBJ_TYPE: u32 = 4;
const LOCK: u32 = 8;
const FREE_LIST: u32 = 12; // {head, tail} pair
const TOTAL_BLOCKS: u32 = FREE_LIST + LIST_HEAD_BYTES;
const BLOCK_SIZE: u32 = TOTAL_BLOCKS + 4;
const CUR_ALLOCATED: u32 = BLOCK_SIZE + 4;
const CUM_ALLOCATED: u32 = CUR_ALLOCATED + 4;

/// Size in bytes of the partition header; blocks start right after.
pub const PARTITION_HDR_BYTES: u32 = CUM_ALLOCATED + 4;

static_assertions::const_assert_eq!(PARTITION_HDR_BYTES % 4, 0);

/// Statistics snapshot of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Number of blocks carved at init time.
    pub total_blocks: u32,
    /// Size of each block in bytes.
    pub block_size: u32,
    /// Blocks currently allocated.
    pub cur_allocated: u32,
    /// Blocks allocated over the partition's lifetime.
    pub cum_allocated: u32,
}

impl PartitionInfo {
    /// Blocks currently on the free list.
    pub fn free_blocks(&self) -> u32 {
        self.total_blocks - self.cur_allocated
    }
}

/// Handle to a fixed-block partition living in the shared arena.
///
/// Created once at system setup and never destroyed; blocks are allocated
/// and freed continuously for the life of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmPartition {
    base: u32,
}

impl SmPartition {
    /// Bytes of arena a partition of `blocks` blocks of `block_size` needs.
    /// Saturates rather than wrapping, so an absurd block count surfaces as
    /// [`ShareError::RegionTooSmall`] instead of a short carve.
    pub const fn bytes_for(blocks: u32, block_size: u32) -> u32 {
        PARTITION_HDR_BYTES.saturating_add(blocks.saturating_mul(block_size))
    }

    /// Carves a new partition over `size` bytes of arena at `base`.
    ///
    /// `block_size` must be 4-aligned and large enough to hold a free-list
    /// node. The number of blocks is `floor((size - header) / block_size)`;
    /// the final fence/read-back of the header stores guarantees a remote
    /// observer never sees a half-initialized partition.
    pub fn init(
        a: &SharedArena,
        base: u32,
        size: u32,
        block_size: u32,
    ) -> Result<SmPartition, ShareError> {
        assert!(base % 4 == 0, "partition base must be 4-aligned");
        assert!(
            block_size % 4 == 0 && block_size >= LIST_NODE_BYTES,
            "block size must be 4-aligned and hold a list node"
        );
        if size < PARTITION_HDR_BYTES + block_size {
            return Err(ShareError::RegionTooSmall {
                need: (PARTITION_HDR_BYTES + block_size) as usize,
                have: size as usize,
            });
        }

        let part = SmPartition { base };
        let total = (size - PARTITION_HDR_BYTES) / block_size;

        a.store_u32(part.field(OBJ_TYPE), OBJ_TYPE_PARTITION);
        part.lock().init(a);
        part.free_list().init(a);
        a.store_u32(part.field(TOTAL_BLOCKS), total);
        a.store_u32(part.field(BLOCK_SIZE), block_size);
        a.store_u32(part.field(CUR_ALLOCATED), 0);
        a.store_u32(part.field(CUM_ALLOCATED), 0);

        let first = base + PARTITION_HDR_BYTES;
        for i in 0..total {
            part.free_list()
                .insert_tail(a, GlobalRef(first + i * block_size));
        }

        // Stamped last: the partition is only discoverable once `verify`
        // holds, and the store's read-back pushes the whole header out.
        a.store_u32(part.field(VERIFY), base ^ VERIFY_TAG);
        Ok(part)
    }

    /// Re-derives a handle for an already-initialized partition at `base`.
    /// Used by follower CPUs after attach.
    pub fn attach(a: &SharedArena, base: u32) -> Result<SmPartition, ShareError> {
        let part = SmPartition { base };
        part.check_verify(a)?;
        Ok(part)
    }

    #[inline]
    fn field(&self, delta: u32) -> u32 {
        self.base + delta
    }

    fn lock(&self) -> SpinLockWord {
        SpinLockWord::at(self.field(LOCK))
    }

    fn free_list(&self) -> SmDlList {
        SmDlList::at(self.field(FREE_LIST))
    }

    fn check_verify(&self, a: &SharedArena) -> Result<(), ShareError> {
        if a.load_u32(self.field(VERIFY)) != self.base ^ VERIFY_TAG
            || a.load_u32(self.field(OBJ_TYPE)) != OBJ_TYPE_PARTITION
        {
            return Err(ShareError::BadVerify);
        }
        Ok(())
    }

    /// Allocates one block.
    ///
    /// The two failure modes are distinct: [`ShareError::LockTimeout`] means
    /// the partition lock could not be taken within `max_tries`, while
    /// [`ShareError::OutOfBlocks`] means the free list was empty.
    pub fn alloc(
        &self,
        a: &SharedArena,
        cpu: &Cpu,
        max_tries: u32,
    ) -> Result<GlobalRef, ShareError> {
        self.check_verify(a)?;
        let level = self.lock().lock_take(a, cpu, max_tries)?;
        let block = self.free_list().pop_head(a);
        let res = match block {
            Some(block) => {
                a.store_u32(
                    self.field(CUR_ALLOCATED),
                    a.load_u32(self.field(CUR_ALLOCATED)) + 1,
                );
                a.store_u32(
                    self.field(CUM_ALLOCATED),
                    a.load_u32(self.field(CUM_ALLOCATED)) + 1,
                );
                Ok(block)
            }
            None => Err(ShareError::OutOfBlocks),
        };
        self.lock().lock_give(a, cpu, level);
        res
    }

    /// Returns `block` to the free list.
    ///
    /// No validity check is performed on `block` -- the caller vouches that
    /// it came from this partition and is not already free.
    pub fn free(
        &self,
        a: &SharedArena,
        cpu: &Cpu,
        max_tries: u32,
        block: GlobalRef,
    ) -> Result<(), ShareError> {
        self.check_verify(a)?;
        if block.is_null() {
            return Err(ShareError::InvalidRef);
        }
        let level = self.lock().lock_take(a, cpu, max_tries)?;
        self.free_list().insert_head(a, block);
        a.store_u32(
            self.field(CUR_ALLOCATED),
            a.load_u32(self.field(CUR_ALLOCATED)) - 1,
        );
        self.lock().lock_give(a, cpu, level);
        Ok(())
    }

    /// Statistics snapshot, taken without the lock (counters may be a tick
    /// stale under contention; fine for diagnostics).
    pub fn info(&self, a: &SharedArena) -> Result<PartitionInfo, ShareError> {
        self.check_verify(a)?;
        Ok(PartitionInfo {
            total_blocks: a.load_u32(self.field(TOTAL_BLOCKS)),
            block_size: a.load_u32(self.field(BLOCK_SIZE)),
            cur_allocated: a.load_u32(self.field(CUR_ALLOCATED)),
            cum_allocated: a.load_u32(self.field(CUM_ALLOCATED)),
        })
    }

    /// The arena offset of the partition header.
    pub fn base(&self) -> u32 {
        self.base
    }
}
