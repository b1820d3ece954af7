use std::{fmt, mem};

use static_assertions::const_assert;

use crate::defer::{DeferQueue, Deferred};
use crate::node::{BoxCell, Value};

/// Slots per pool chunk.
pub const CHUNK_SLOTS: usize = 128;
const BITMAP_BYTES: usize = CHUNK_SLOTS / 8;
/// Freelist terminator inside a chunk.
const NO_SLOT: u32 = CHUNK_SLOTS as u32;

const_assert!(CHUNK_SLOTS % 8 == 0);
const_assert!(CHUNK_SLOTS <= u8::MAX as usize + 1);
// A vacant slot must be able to carry the freelist link.
const_assert!(mem::size_of::<Slot<BoxCell>>() >= mem::size_of::<u32>());

/// Handle to a value cell. The index encodes `chunk * CHUNK_SLOTS + slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId(pub(crate) u32);

/// Handle to a list link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoxId(pub(crate) u32);

/// One pool slot: either vacant (threaded into the chunk freelist) or
/// live, in which case it carries the reference counter word.
enum Slot<T> {
    Free { next: u32 },
    Live { refs: u32, cell: T },
}

struct Chunk<T> {
    slots: Vec<Slot<T>>,
    live: [u8; BITMAP_BYTES],
    marks: [u8; BITMAP_BYTES],
    free_head: u32,
    free_count: u8,
}

#[inline]
fn bit_get(map: &[u8; BITMAP_BYTES], offset: usize) -> bool {
    map[offset / 8] & (1 << (offset % 8)) != 0
}

#[inline]
fn bit_set(map: &mut [u8; BITMAP_BYTES], offset: usize) {
    map[offset / 8] |= 1 << (offset % 8);
}

#[inline]
fn bit_clear(map: &mut [u8; BITMAP_BYTES], offset: usize) {
    map[offset / 8] &= !(1 << (offset % 8));
}

impl<T> Chunk<T> {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(CHUNK_SLOTS);
        for i in 0..CHUNK_SLOTS as u32 {
            let next = if i + 1 < CHUNK_SLOTS as u32 { i + 1 } else { NO_SLOT };
            slots.push(Slot::Free { next });
        }
        Self {
            slots,
            live: [0; BITMAP_BYTES],
            marks: [0; BITMAP_BYTES],
            free_head: 0,
            free_count: CHUNK_SLOTS as u8,
        }
    }
}

struct Pool<T> {
    chunks: Vec<Chunk<T>>,
}

impl<T> Pool<T> {
    fn new() -> Self {
        Self { chunks: Vec::new() }
    }

    #[inline]
    fn split(id: u32) -> (usize, usize) {
        ((id as usize) / CHUNK_SLOTS, (id as usize) % CHUNK_SLOTS)
    }

    /// Pop the freelist of the first chunk with a vacant slot, growing the
    /// pool by one chunk when every freelist is exhausted. The returned
    /// slot starts with one reference, owned by the caller.
    fn allocate(&mut self, cell: T) -> u32 {
        let chunk_index = match self.chunks.iter().position(|c| c.free_head != NO_SLOT) {
            Some(i) => i,
            None => {
                self.chunks.push(Chunk::new());
                self.chunks.len() - 1
            }
        };
        let chunk = &mut self.chunks[chunk_index];
        let slot = chunk.free_head as usize;
        let next = match chunk.slots[slot] {
            Slot::Free { next } => next,
            Slot::Live { .. } => unreachable!("freelist points at a live slot"),
        };
        chunk.free_head = next;
        chunk.free_count -= 1;
        chunk.slots[slot] = Slot::Live { refs: 1, cell };
        bit_set(&mut chunk.live, slot);
        (chunk_index * CHUNK_SLOTS + slot) as u32
    }

    /// Clear the live bit and thread the slot back onto the freelist,
    /// returning the payload. Freeing a vacant slot is a no-op, so the
    /// sweep never double-frees an object whose reference count also
    /// reached zero.
    fn free(&mut self, id: u32) -> Option<T> {
        let (chunk_index, slot) = Self::split(id);
        let chunk = self.chunks.get_mut(chunk_index)?;
        if !bit_get(&chunk.live, slot) {
            return None;
        }
        let old = mem::replace(&mut chunk.slots[slot], Slot::Free { next: chunk.free_head });
        chunk.free_head = slot as u32;
        chunk.free_count += 1;
        bit_clear(&mut chunk.live, slot);
        match old {
            Slot::Live { cell, .. } => Some(cell),
            Slot::Free { .. } => None,
        }
    }

    fn get(&self, id: u32) -> Option<&T> {
        let (chunk_index, slot) = Self::split(id);
        match self.chunks.get(chunk_index)?.slots.get(slot)? {
            Slot::Live { cell, .. } => Some(cell),
            Slot::Free { .. } => None,
        }
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let (chunk_index, slot) = Self::split(id);
        match self.chunks.get_mut(chunk_index)?.slots.get_mut(slot)? {
            Slot::Live { cell, .. } => Some(cell),
            Slot::Free { .. } => None,
        }
    }

    fn refs(&self, id: u32) -> Option<u32> {
        let (chunk_index, slot) = Self::split(id);
        match self.chunks.get(chunk_index)?.slots.get(slot)? {
            Slot::Live { refs, .. } => Some(*refs),
            Slot::Free { .. } => None,
        }
    }

    fn retain(&mut self, id: u32) {
        let (chunk_index, slot) = Self::split(id);
        if let Some(Slot::Live { refs, .. }) =
            self.chunks.get_mut(chunk_index).and_then(|c| c.slots.get_mut(slot))
        {
            *refs += 1;
        }
    }

    /// Drop one reference; true when the count reached zero. Counts never
    /// go negative: releasing a vacant or zero-count slot is a no-op.
    fn release(&mut self, id: u32) -> bool {
        let (chunk_index, slot) = Self::split(id);
        if let Some(Slot::Live { refs, .. }) =
            self.chunks.get_mut(chunk_index).and_then(|c| c.slots.get_mut(slot))
        {
            if *refs > 0 {
                *refs -= 1;
                return *refs == 0;
            }
        }
        false
    }

    fn setup_marks(&mut self) {
        for chunk in &mut self.chunks {
            chunk.marks = [0; BITMAP_BYTES];
        }
    }

    fn set_mark(&mut self, id: u32) {
        let (chunk_index, slot) = Self::split(id);
        if let Some(chunk) = self.chunks.get_mut(chunk_index) {
            bit_set(&mut chunk.marks, slot);
        }
    }

    fn get_mark(&self, id: u32) -> bool {
        let (chunk_index, slot) = Self::split(id);
        match self.chunks.get(chunk_index) {
            Some(chunk) => bit_get(&chunk.marks, slot),
            None => true,
        }
    }

    /// Collect every slot that is allocated but unmarked.
    fn unmarked(&self, dead: &mut Vec<u32>) {
        for (chunk_index, chunk) in self.chunks.iter().enumerate() {
            for slot in 0..CHUNK_SLOTS {
                if bit_get(&chunk.live, slot) && !bit_get(&chunk.marks, slot) {
                    dead.push((chunk_index * CHUNK_SLOTS + slot) as u32);
                }
            }
        }
    }

    fn free_slots(&self) -> usize {
        self.chunks.iter().map(|c| c.free_count as usize).sum()
    }

    fn total_slots(&self) -> usize {
        self.chunks.len() * CHUNK_SLOTS
    }
}

/// Free and total figures for both pools, for the REPL report and for
/// allocator introspection in tests.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    pub value_slots: usize,
    pub value_slots_free: usize,
    pub link_slots: usize,
    pub link_slots_free: usize,
}

impl HeapStats {
    /// Free pool bytes, the figure printed by constrained builds.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.value_slots_free * mem::size_of::<Slot<Value>>()
            + self.link_slots_free * mem::size_of::<Slot<BoxCell>>()
    }

    #[must_use]
    pub fn live_values(&self) -> usize {
        self.value_slots - self.value_slots_free
    }

    #[must_use]
    pub fn live_links(&self) -> usize {
        self.link_slots - self.link_slots_free
    }
}

/// Worklist entry for the mark phase.
enum MarkItem {
    Value(ValueId),
    Link(BoxId),
}

/// The interpreter heap: one pool of value cells, one pool of list links,
/// a deferred-deletion queue, and the three canonical singletons.
///
/// Strings and data buffers hang off the slot payloads and go through the
/// platform allocator; freeing the slot frees them.
pub struct Heap {
    values: Pool<Value>,
    links: Pool<BoxCell>,
    defer: DeferQueue,
    atom_true: ValueId,
    atom_false: ValueId,
    list_empty: ValueId,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        let mut values = Pool::new();
        let atom_true = ValueId(values.allocate(Value::Boolean(true)));
        let atom_false = ValueId(values.allocate(Value::Boolean(false)));
        let list_empty = ValueId(values.allocate(Value::List(None)));
        Self {
            values,
            links: Pool::new(),
            defer: DeferQueue::new(),
            atom_true,
            atom_false,
            list_empty,
        }
    }

    /// The `#t` singleton.
    #[inline]
    #[must_use]
    pub fn truth(&self) -> ValueId {
        self.atom_true
    }

    /// The `#f` singleton.
    #[inline]
    #[must_use]
    pub fn falsity(&self) -> ValueId {
        self.atom_false
    }

    /// The canonical empty list.
    #[inline]
    #[must_use]
    pub fn empty(&self) -> ValueId {
        self.list_empty
    }

    #[inline]
    #[must_use]
    pub fn boolean(&mut self, b: bool) -> ValueId {
        let id = if b { self.atom_true } else { self.atom_false };
        self.retain(id);
        id
    }

    /// Allocate a value cell. Booleans and the empty list are canonical:
    /// allocating them hands back the shared singleton instead, so those
    /// values keep pointer identity across the whole process.
    pub fn alloc_value(&mut self, value: Value) -> ValueId {
        match value {
            Value::Boolean(b) => self.boolean(b),
            Value::List(None) => {
                self.retain(self.list_empty);
                self.list_empty
            }
            other => ValueId(self.values.allocate(other)),
        }
    }

    /// Allocate a list link. Takes ownership of the `item` and `next`
    /// references held by the caller.
    pub fn alloc_link(&mut self, item: ValueId, next: Option<BoxId>) -> BoxId {
        BoxId(self.links.allocate(BoxCell { item, next }))
    }

    /// Allocate a list value around an existing head link, taking
    /// ownership of the head reference.
    pub fn alloc_list(&mut self, head: Option<BoxId>) -> ValueId {
        match head {
            None => {
                self.retain(self.list_empty);
                self.list_empty
            }
            some => ValueId(self.values.allocate(Value::List(some))),
        }
    }

    #[must_use]
    pub fn value(&self, id: ValueId) -> &Value {
        self.values.get(id.0).expect("stale value handle")
    }

    #[must_use]
    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        self.values.get_mut(id.0).expect("stale value handle")
    }

    #[must_use]
    pub fn link(&self, id: BoxId) -> BoxCell {
        *self.links.get(id.0).expect("stale link handle")
    }

    /// Swap the item of a link in place, used by association-list
    /// replacement. Takes ownership of the new reference and drops the
    /// old one.
    pub fn set_link_item(&mut self, id: BoxId, item: ValueId) {
        let cell = self.links.get_mut(id.0).expect("stale link handle");
        let old = mem::replace(&mut cell.item, item);
        self.release(old);
    }

    #[inline]
    pub fn retain(&mut self, id: ValueId) {
        self.values.retain(id.0);
    }

    #[inline]
    pub fn retain_link(&mut self, id: BoxId) {
        self.links.retain(id.0);
    }

    pub fn release(&mut self, id: ValueId) {
        if self.values.release(id.0) {
            self.push_deferred(Deferred::Value(id));
        }
    }

    pub fn release_link(&mut self, id: BoxId) {
        if self.links.release(id.0) {
            self.push_deferred(Deferred::Link(id));
        }
    }

    fn push_deferred(&mut self, entry: Deferred) {
        if let Some(old) = self.defer.enqueue(entry) {
            // Queue overflowed and was reinitialized: drain the previous
            // queue one entry at a time, chasing cascades after each so
            // the fresh queue cannot immediately overflow again.
            for entry in old.into_iter().flatten() {
                self.delete_one(entry);
                self.process_deletions();
            }
        }
    }

    /// Drain the deferred-deletion queue. Freeing an object releases its
    /// children, which may enqueue further entries; the loop keeps going
    /// until the queue is empty, so destruction of arbitrarily long
    /// chains needs only constant native stack.
    pub fn process_deletions(&mut self) -> usize {
        let mut count = 0;
        while let Some(entry) = self.defer.dequeue() {
            self.delete_one(entry);
            count += 1;
        }
        count
    }

    fn delete_one(&mut self, entry: Deferred) {
        match entry {
            Deferred::Value(id) => {
                // Skip entries resurrected or already swept since enqueue.
                if self.values.refs(id.0) != Some(0) {
                    return;
                }
                if let Some(cell) = self.values.free(id.0) {
                    self.release_value_children(cell);
                }
            }
            Deferred::Link(id) => {
                if self.links.refs(id.0) != Some(0) {
                    return;
                }
                if let Some(cell) = self.links.free(id.0) {
                    self.release_link_children(cell);
                }
            }
        }
    }

    fn release_value_children(&mut self, cell: Value) {
        if let Value::List(Some(head)) = cell {
            self.release_link(head);
        }
    }

    fn release_link_children(&mut self, cell: BoxCell) {
        self.release(cell.item);
        if let Some(next) = cell.next {
            self.release_link(next);
        }
    }

    /// Mark-and-sweep over both pools. Everything reachable from `roots`
    /// survives; any slot allocated but unmarked is destructed and
    /// returned to its pool. Objects outside the pools (string and data
    /// buffers) ride along with their owning slot.
    pub fn sweep(&mut self, roots: &[ValueId]) -> usize {
        self.values.setup_marks();
        self.links.setup_marks();

        let mut work: Vec<MarkItem> = roots.iter().map(|&r| MarkItem::Value(r)).collect();
        while let Some(item) = work.pop() {
            match item {
                MarkItem::Value(id) => {
                    if self.values.get_mark(id.0) {
                        continue;
                    }
                    self.values.set_mark(id.0);
                    if let Some(Value::List(Some(head))) = self.values.get(id.0) {
                        work.push(MarkItem::Link(*head));
                    }
                }
                MarkItem::Link(id) => {
                    if self.links.get_mark(id.0) {
                        continue;
                    }
                    self.links.set_mark(id.0);
                    if let Some(cell) = self.links.get(id.0) {
                        work.push(MarkItem::Value(cell.item));
                        if let Some(next) = cell.next {
                            work.push(MarkItem::Link(next));
                        }
                    }
                }
            }
        }

        self.commit()
    }

    /// Destruct every live-but-unmarked slot. Children of freed slots are
    /// released afterwards; a child freed directly by the same sweep makes
    /// the release a no-op because its live bit is already clear.
    fn commit(&mut self) -> usize {
        let mut dead_values = Vec::new();
        let mut dead_links = Vec::new();
        self.values.unmarked(&mut dead_values);
        self.links.unmarked(&mut dead_links);
        let reclaimed = dead_values.len() + dead_links.len();

        let mut orphans: Vec<Value> = Vec::with_capacity(dead_values.len());
        for id in dead_values {
            if let Some(cell) = self.values.free(id) {
                orphans.push(cell);
            }
        }
        let mut orphan_links: Vec<BoxCell> = Vec::with_capacity(dead_links.len());
        for id in dead_links {
            if let Some(cell) = self.links.free(id) {
                orphan_links.push(cell);
            }
        }
        for cell in orphans {
            self.release_value_children(cell);
        }
        for cell in orphan_links {
            self.release_link_children(cell);
        }
        self.process_deletions();
        reclaimed
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            value_slots: self.values.total_slots(),
            value_slots_free: self.values.free_slots(),
            link_slots: self.links.total_slots(),
            link_slots_free: self.links.free_slots(),
        }
    }

    /// Reference count of a value slot, for tests and debugging.
    #[must_use]
    pub fn value_refs(&self, id: ValueId) -> Option<u32> {
        self.values.refs(id.0)
    }

    /// True when the slot behind the handle is still allocated.
    #[must_use]
    pub fn is_live(&self, id: ValueId) -> bool {
        self.values.get(id.0).is_some()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "Heap(values {}/{}, links {}/{})",
            stats.live_values(),
            stats.value_slots,
            stats.live_links(),
            stats.link_slots
        )
    }
}

#[test]
fn test_pool_reuses_freed_slots() {
    let mut heap = Heap::new();
    let a = heap.alloc_value(Value::Int(1));
    let before = heap.stats();
    heap.release(a);
    heap.process_deletions();
    assert!(!heap.is_live(a));
    let b = heap.alloc_value(Value::Int(2));
    assert_eq!(a, b, "freed slot is recycled first");
    assert_eq!(heap.stats().value_slots, before.value_slots);
}

#[test]
fn test_free_is_idempotent() {
    let mut pool: Pool<Value> = Pool::new();
    let id = pool.allocate(Value::Int(7));
    assert!(pool.free(id).is_some());
    assert!(pool.free(id).is_none());
    assert_eq!(pool.free_slots(), CHUNK_SLOTS);
}

#[test]
fn test_pool_grows_by_chunks() {
    let mut heap = Heap::new();
    let mut held = Vec::new();
    for i in 0..(CHUNK_SLOTS as i64 * 2) {
        held.push(heap.alloc_value(Value::Int(i)));
    }
    let stats = heap.stats();
    assert!(stats.value_slots >= CHUNK_SLOTS * 2);
    for id in held {
        heap.release(id);
    }
    heap.process_deletions();
}
