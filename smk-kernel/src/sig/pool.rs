//! The global queued-signal buffer pool.
//!
//! A fixed set of records allocated up front and recycled through a LIFO
//! free list. Queued sends draw from it and fail with
//! [`crate::error::SigError::NoBuffers`] when it runs dry; the pool never
//! blocks and never grows. Records waiting on a task's per-signal queue are
//! chained through the same `next` index the free list uses.

use alloc::vec::Vec;

use super::SigInfo;

/// Null chain index.
pub(crate) const NIL: u32 = u32::MAX;

struct PoolEntry {
    info: SigInfo,
    next: u32,
}

/// Fixed pool of queued-signal payload records.
pub struct SigPool {
    entries: Vec<PoolEntry>,
    free_head: u32,
    free: usize,
}

impl SigPool {
    /// A pool of `buffers` records, all free.
    pub fn with_buffers(buffers: usize) -> Self {
        let mut entries = Vec::with_capacity(buffers);
        for i in 0..buffers {
            entries.push(PoolEntry {
                info: SigInfo::default(),
                // LIFO: each entry points at the previous one.
                next: if i == 0 { NIL } else { (i - 1) as u32 },
            });
        }
        SigPool {
            free_head: if buffers == 0 { NIL } else { (buffers - 1) as u32 },
            free: buffers,
            entries,
        }
    }

    /// Records currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Takes a record off the free list and fills it with `info`.
    pub(crate) fn alloc(&mut self, info: SigInfo) -> Option<u32> {
        let idx = self.free_head;
        if idx == NIL {
            return None;
        }
        let entry = &mut self.entries[idx as usize];
        self.free_head = entry.next;
        entry.info = info;
        entry.next = NIL;
        self.free -= 1;
        Some(idx)
    }

    /// Reads `idx`'s payload and successor, then returns the record to the
    /// free list.
    pub(crate) fn take(&mut self, idx: u32) -> (SigInfo, u32) {
        let entry = &mut self.entries[idx as usize];
        let info = entry.info;
        let next = entry.next;
        entry.next = self.free_head;
        self.free_head = idx;
        self.free += 1;
        (info, next)
    }

    /// Chains `idx` after `tail` on a per-signal queue.
    pub(crate) fn set_next(&mut self, tail: u32, idx: u32) {
        self.entries[tail as usize].next = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_then_recycle() {
        let mut pool = SigPool::with_buffers(2);
        let a = pool.alloc(SigInfo::default()).unwrap();
        let b = pool.alloc(SigInfo::default()).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.alloc(SigInfo::default()), None);
        assert_eq!(pool.free_count(), 0);

        let (_, next) = pool.take(b);
        assert_eq!(next, NIL);
        // LIFO: the freshly freed record is handed out next.
        assert_eq!(pool.alloc(SigInfo::default()), Some(b));
    }

    #[test]
    fn chained_records_read_back_in_order() {
        let mut pool = SigPool::with_buffers(4);
        let first = pool
            .alloc(SigInfo {
                signo: 10,
                code: 0,
                value: 1,
            })
            .unwrap();
        let second = pool
            .alloc(SigInfo {
                signo: 10,
                code: 0,
                value: 2,
            })
            .unwrap();
        pool.set_next(first, second);

        let (info, next) = pool.take(first);
        assert_eq!(info.value, 1);
        assert_eq!(next, second);
        let (info, next) = pool.take(second);
        assert_eq!(info.value, 2);
        assert_eq!(next, NIL);
    }
}
