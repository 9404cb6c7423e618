//! The shared memory arena and the primitives layered directly on it.
//!
//! Every structure visible to more than one CPU lives inside a single
//! [`SharedArena`]. Cross-CPU references are *offsets* into the arena
//! ([`GlobalRef`]), never pointers; a CPU translates an offset to a local
//! address only at the point of access, inside the arena's accessors. All
//! multi-byte fields are stored big-endian regardless of host endianness,
//! because CPUs in the cluster may differ in native byte order.
//!
//! Each store is followed by a fence and a read-back of the written word, and
//! each load is preceded by a fence. On coherent hosts this is stronger than
//! needed; on the bus-shared hardware this models, it is the minimum for a
//! remote CPU to observe a consistent view.

use core::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{fence, AtomicU32, Ordering},
};

use alloc::{boxed::Box, vec};

/// A cluster-wide reference to an object in the shared arena: a byte offset
/// from the arena base.
///
/// Offset 0 holds the region anchor, so `GlobalRef(0)` doubles as the null
/// sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalRef(pub u32);

impl GlobalRef {
    /// The null reference.
    pub const NULL: GlobalRef = GlobalRef(0);

    /// Returns `true` if this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The byte offset of a field at `delta` bytes into the referenced object.
    #[inline]
    pub const fn field(self, delta: u32) -> u32 {
        self.0 + delta
    }
}

impl fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "+{:#x}", self.0)
        }
    }
}

/// The shared memory region, word-granular and 4-byte aligned.
///
/// All layout constants in this crate keep every field on a 4-byte boundary,
/// so the arena stores whole words. Lock words are additionally accessed
/// through [`SharedArena::lock_word`], which hands out an [`AtomicU32`] view
/// of the same storage for the hardware test-and-set.
pub struct SharedArena {
    words: Box<[UnsafeCell<u32>]>,
}

// Safety: concurrent access is governed by the spin-lock discipline of the
// structures stored inside the arena; raw data races on non-lock words are
// prevented by that discipline, and lock words are only touched atomically.
unsafe impl Send for SharedArena {}
unsafe impl Sync for SharedArena {}

impl SharedArena {
    /// Allocates a zeroed arena of at least `bytes` bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        let words = bytes.div_ceil(4);
        SharedArena {
            words: vec![0u32; words]
                .into_iter()
                .map(UnsafeCell::new)
                .collect(),
        }
    }

    /// The usable size of the arena in bytes.
    pub fn len(&self) -> usize {
        self.words.len() * 4
    }

    /// Returns `true` if the arena has no capacity at all.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn word(&self, off: u32) -> &UnsafeCell<u32> {
        assert!(off % 4 == 0, "unaligned shared-arena access at {off:#x}");
        let index = (off / 4) as usize;
        assert!(
            index < self.words.len(),
            "shared-arena access out of bounds at {off:#x}"
        );
        &self.words[index]
    }

    /// Loads a big-endian word, fenced.
    pub fn load_u32(&self, off: u32) -> u32 {
        let cell = self.word(off);
        // Bridge flush: order this read after everything the remote lock
        // holder published.
        fence(Ordering::SeqCst);
        // Safety: in-bounds word; races are excluded by the lock discipline.
        let raw = unsafe { core::ptr::read_volatile(cell.get()) };
        u32::from_be(raw)
    }

    /// Stores a big-endian word, fenced, and reads it back to force posted
    /// writes out before the caller proceeds.
    pub fn store_u32(&self, off: u32, value: u32) {
        let cell = self.word(off);
        // Safety: in-bounds word; races are excluded by the lock discipline.
        unsafe { core::ptr::write_volatile(cell.get(), value.to_be()) };
        fence(Ordering::SeqCst);
        // Read-back: on hardware with posted writes the store is not globally
        // visible until a read of the same line completes.
        // Safety: same word as above.
        let _ = unsafe { core::ptr::read_volatile(cell.get()) };
    }

    /// Loads a [`GlobalRef`] field.
    #[inline]
    pub fn load_ref(&self, off: u32) -> GlobalRef {
        GlobalRef(self.load_u32(off))
    }

    /// Stores a [`GlobalRef`] field.
    #[inline]
    pub fn store_ref(&self, off: u32, value: GlobalRef) {
        self.store_u32(off, value.0);
    }

    /// An atomic view of a lock word, for the hardware test-and-set.
    ///
    /// The value stored through this view keeps the big-endian convention so
    /// that non-atomic readers ([`SharedArena::load_u32`]) agree on it.
    pub fn lock_word(&self, off: u32) -> &AtomicU32 {
        let cell = self.word(off);
        // Safety: the cell is 4-byte aligned (checked in `word`), lives as
        // long as `self`, and all concurrent access to lock words goes
        // through this same atomic view.
        unsafe { AtomicU32::from_ptr(cell.get()) }
    }
}

/// Byte offset of a list node's `next` link.
const NODE_NEXT: u32 = 0;
/// Byte offset of a list node's `prev` link.
const NODE_PREV: u32 = 4;

/// Size in bytes of the head/tail pair of an in-arena list.
pub const LIST_HEAD_BYTES: u32 = 8;
/// Size in bytes of the link node embedded in each listed object.
pub const LIST_NODE_BYTES: u32 = 8;

/// Handle to a doubly-linked list whose head/tail pair and nodes all live in
/// the shared arena.
///
/// The embedded link node must sit at byte offset 0 of every listed object,
/// so a node reference and an object reference are the same [`GlobalRef`].
/// All operations are O(1) except [`SmDlList::count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmDlList {
    head_off: u32,
}

impl SmDlList {
    /// A list whose `{head, tail}` pair lives at `head_off` in the arena.
    pub const fn at(head_off: u32) -> Self {
        SmDlList { head_off }
    }

    #[inline]
    fn tail_off(&self) -> u32 {
        self.head_off + 4
    }

    /// Resets the list to empty.
    pub fn init(&self, a: &SharedArena) {
        a.store_ref(self.head_off, GlobalRef::NULL);
        a.store_ref(self.tail_off(), GlobalRef::NULL);
    }

    /// The first node, or null.
    pub fn first(&self, a: &SharedArena) -> GlobalRef {
        a.load_ref(self.head_off)
    }

    /// Returns `true` if the list holds no nodes.
    pub fn is_empty(&self, a: &SharedArena) -> bool {
        self.first(a).is_null()
    }

    /// Inserts `node` at the tail.
    pub fn insert_tail(&self, a: &SharedArena, node: GlobalRef) {
        debug_assert!(!node.is_null());
        let old_tail = a.load_ref(self.tail_off());
        a.store_ref(node.field(NODE_NEXT), GlobalRef::NULL);
        a.store_ref(node.field(NODE_PREV), old_tail);
        if old_tail.is_null() {
            a.store_ref(self.head_off, node);
        } else {
            a.store_ref(old_tail.field(NODE_NEXT), node);
        }
        a.store_ref(self.tail_off(), node);
    }

    /// Inserts `node` at the head.
    pub fn insert_head(&self, a: &SharedArena, node: GlobalRef) {
        debug_assert!(!node.is_null());
        let old_head = a.load_ref(self.head_off);
        a.store_ref(node.field(NODE_PREV), GlobalRef::NULL);
        a.store_ref(node.field(NODE_NEXT), old_head);
        if old_head.is_null() {
            a.store_ref(self.tail_off(), node);
        } else {
            a.store_ref(old_head.field(NODE_PREV), node);
        }
        a.store_ref(self.head_off, node);
    }

    /// Unlinks `node`. The node must currently be on this list.
    pub fn remove(&self, a: &SharedArena, node: GlobalRef) {
        debug_assert!(!node.is_null());
        let next = a.load_ref(node.field(NODE_NEXT));
        let prev = a.load_ref(node.field(NODE_PREV));
        if prev.is_null() {
            a.store_ref(self.head_off, next);
        } else {
            a.store_ref(prev.field(NODE_NEXT), next);
        }
        if next.is_null() {
            a.store_ref(self.tail_off(), prev);
        } else {
            a.store_ref(next.field(NODE_PREV), prev);
        }
    }

    /// Unlinks and returns the head node, or `None` if the list is empty.
    pub fn pop_head(&self, a: &SharedArena) -> Option<GlobalRef> {
        let head = self.first(a);
        if head.is_null() {
            return None;
        }
        self.remove(a, head);
        Some(head)
    }

    /// Splices the entire contents of `self` onto the tail of `dst`, leaving
    /// `self` empty. O(1).
    pub fn concat_into(&self, a: &SharedArena, dst: &SmDlList) {
        let src_head = a.load_ref(self.head_off);
        if src_head.is_null() {
            return;
        }
        let src_tail = a.load_ref(self.tail_off());
        let dst_tail = a.load_ref(dst.tail_off());
        if dst_tail.is_null() {
            a.store_ref(dst.head_off, src_head);
        } else {
            a.store_ref(dst_tail.field(NODE_NEXT), src_head);
            a.store_ref(src_head.field(NODE_PREV), dst_tail);
        }
        a.store_ref(dst.tail_off(), src_tail);
        self.init(a);
    }

    /// Number of nodes on the list. O(n), diagnostics only.
    pub fn count(&self, a: &SharedArena) -> usize {
        let mut n = 0;
        let mut node = self.first(a);
        while !node.is_null() {
            n += 1;
            node = a.load_ref(node.field(NODE_NEXT));
        }
        n
    }

    /// Calls `f` for each node from head to tail, stopping early if `f`
    /// returns `false`.
    pub fn for_each(&self, a: &SharedArena, mut f: impl FnMut(GlobalRef) -> bool) {
        let mut node = self.first(a);
        while !node.is_null() {
            let next = a.load_ref(node.field(NODE_NEXT));
            if !f(node) {
                break;
            }
            node = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_list() -> (SharedArena, SmDlList) {
        let a = SharedArena::with_capacity(1024);
        let list = SmDlList::at(16);
        list.init(&a);
        (a, list)
    }

    #[test]
    fn big_endian_on_the_wire() {
        let a = SharedArena::with_capacity(64);
        a.store_u32(8, 0x0102_0304);
        // The raw word must hold big-endian bytes regardless of host order.
        let raw = unsafe { core::ptr::read_volatile(a.word(8).get()) };
        assert_eq!(raw.to_ne_bytes(), [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(a.load_u32(8), 0x0102_0304);
    }

    #[test]
    fn list_fifo_order() {
        let (a, list) = arena_with_list();
        for off in [64u32, 96, 128] {
            list.insert_tail(&a, GlobalRef(off));
        }
        assert_eq!(list.count(&a), 3);
        assert_eq!(list.pop_head(&a), Some(GlobalRef(64)));
        assert_eq!(list.pop_head(&a), Some(GlobalRef(96)));
        assert_eq!(list.pop_head(&a), Some(GlobalRef(128)));
        assert_eq!(list.pop_head(&a), None);
        assert!(list.is_empty(&a));
    }

    #[test]
    fn head_insert_precedes() {
        let (a, list) = arena_with_list();
        list.insert_tail(&a, GlobalRef(64));
        list.insert_head(&a, GlobalRef(96));
        assert_eq!(list.pop_head(&a), Some(GlobalRef(96)));
        assert_eq!(list.pop_head(&a), Some(GlobalRef(64)));
    }

    #[test]
    fn remove_middle_node() {
        let (a, list) = arena_with_list();
        for off in [64u32, 96, 128] {
            list.insert_tail(&a, GlobalRef(off));
        }
        list.remove(&a, GlobalRef(96));
        assert_eq!(list.count(&a), 2);
        assert_eq!(list.pop_head(&a), Some(GlobalRef(64)));
        assert_eq!(list.pop_head(&a), Some(GlobalRef(128)));
    }

    #[test]
    fn concat_is_order_preserving_and_empties_source() {
        let (a, src) = arena_with_list();
        let dst = SmDlList::at(32);
        dst.init(&a);
        dst.insert_tail(&a, GlobalRef(64));
        src.insert_tail(&a, GlobalRef(96));
        src.insert_tail(&a, GlobalRef(128));

        src.concat_into(&a, &dst);
        assert!(src.is_empty(&a));
        assert_eq!(dst.count(&a), 3);
        assert_eq!(dst.pop_head(&a), Some(GlobalRef(64)));
        assert_eq!(dst.pop_head(&a), Some(GlobalRef(96)));
        assert_eq!(dst.pop_head(&a), Some(GlobalRef(128)));
    }

    #[test]
    fn concat_into_empty_destination() {
        let (a, src) = arena_with_list();
        let dst = SmDlList::at(32);
        dst.init(&a);
        src.insert_tail(&a, GlobalRef(64));
        src.concat_into(&a, &dst);
        assert_eq!(dst.pop_head(&a), Some(GlobalRef(64)));
        assert!(dst.is_empty(&a));
    }
}
