use static_assertions::const_assert_eq;

use crate::heap::{BoxId, ValueId};

/// Queue capacity. Head and tail are byte-wide and wrap by `u8`
/// arithmetic, so the capacity must stay in lockstep with that width.
pub const QUEUE_SIZE: usize = 256;

const_assert_eq!(QUEUE_SIZE, u8::MAX as usize + 1);

/// A handle whose reference count reached zero, waiting to be freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    Value(ValueId),
    Link(BoxId),
}

/// Bounded circular queue of pending deletions.
///
/// Dropping the last handle to a long list would otherwise unwind
/// link-by-link on the native stack; enqueueing the zero-count object and
/// draining the queue in a loop bounds that depth to a constant.
pub struct DeferQueue {
    entries: [Option<Deferred>; QUEUE_SIZE],
    head: u8,
    tail: u8,
}

impl DeferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: [None; QUEUE_SIZE],
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Append an entry. When the tail wraps onto the head the queue is
    /// full: it is reinitialized and the previous entries are handed back
    /// so the caller can drain them one at a time, processing cascades
    /// after each.
    pub fn enqueue(&mut self, entry: Deferred) -> Option<[Option<Deferred>; QUEUE_SIZE]> {
        self.entries[self.tail as usize] = Some(entry);
        self.tail = self.tail.wrapping_add(1);
        if self.tail == self.head {
            let old = core::mem::replace(&mut self.entries, [None; QUEUE_SIZE]);
            self.head = 0;
            self.tail = 0;
            Some(old)
        } else {
            None
        }
    }

    pub fn dequeue(&mut self) -> Option<Deferred> {
        if self.is_empty() {
            return None;
        }
        let entry = self.entries[self.head as usize].take();
        self.head = self.head.wrapping_add(1);
        entry
    }
}

impl Default for DeferQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_queue_order() {
    let mut q = DeferQueue::new();
    assert!(q.is_empty());
    for i in 0..10u32 {
        assert!(q.enqueue(Deferred::Value(ValueId(i))).is_none());
    }
    for i in 0..10u32 {
        assert_eq!(q.dequeue(), Some(Deferred::Value(ValueId(i))));
    }
    assert_eq!(q.dequeue(), None);
}

#[test]
fn test_queue_overflow_hands_back_entries() {
    let mut q = DeferQueue::new();
    for i in 0..QUEUE_SIZE as u32 - 1 {
        assert!(q.enqueue(Deferred::Value(ValueId(i))).is_none());
    }
    let old = q
        .enqueue(Deferred::Value(ValueId(QUEUE_SIZE as u32 - 1)))
        .expect("256th enqueue must overflow");
    assert_eq!(old.iter().filter(|e| e.is_some()).count(), QUEUE_SIZE);
    assert!(q.is_empty());
}

#[test]
fn test_queue_wraps_around() {
    let mut q = DeferQueue::new();
    for round in 0..5u32 {
        for i in 0..100 {
            assert!(q.enqueue(Deferred::Link(BoxId(round * 100 + i))).is_none());
        }
        for i in 0..100 {
            assert_eq!(q.dequeue(), Some(Deferred::Link(BoxId(round * 100 + i))));
        }
    }
}
