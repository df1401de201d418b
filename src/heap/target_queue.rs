//! Per-region inbound reference queue.
//!
//! The cross-machine transport and the mutator's barrier bookkeeping push
//! the references that enter a region from outside; the worker that claims
//! the region drains them as that region's roots for the cycle. The main
//! queue is a bounded lock-free ring; pushes that miss land in an unbounded
//! spill area drained first so thieves keep finding work in the ring.

use crossbeam::queue::{ArrayQueue, SegQueue};

use crate::object::{HeapAddr, ObjectRef, WORD_BYTES};

/// An inbound reference: a full-width object reference or a narrow
/// (compressed) one stored as a word offset from the heap base.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TargetRef {
    Full(ObjectRef),
    Narrow(u32),
}

impl TargetRef {
    /// Decode against the heap base; `None` for a null narrow slot.
    #[inline]
    pub fn decode(self, heap_start: HeapAddr) -> Option<ObjectRef> {
        match self {
            TargetRef::Full(obj) => Some(obj),
            TargetRef::Narrow(0) => None,
            TargetRef::Narrow(off) => ObjectRef::from_addr(
                heap_start.add_bytes(off as usize * WORD_BYTES),
            ),
        }
    }

    /// Compress an object reference relative to the heap base.
    pub fn narrow(obj: ObjectRef, heap_start: HeapAddr) -> TargetRef {
        TargetRef::Narrow(obj.addr().words_since(heap_start) as u32)
    }
}

/// Bounded MPMC queue plus spill area holding a region's cycle roots.
///
/// # Examples
///
/// ```
/// use conmark::heap::{TargetObjQueue, TargetRef};
/// use conmark::object::{HeapAddr, ObjectRef};
///
/// let queue = TargetObjQueue::new(4);
/// let obj = ObjectRef::from_addr(HeapAddr::new(0x1000)).unwrap();
/// queue.push(TargetRef::Full(obj));
///
/// assert!(!queue.is_empty());
/// assert_eq!(queue.pop_local(0), Some(TargetRef::Full(obj)));
/// assert!(queue.is_empty());
/// ```
pub struct TargetObjQueue {
    ring: ArrayQueue<TargetRef>,
    overflow: SegQueue<TargetRef>,
}

impl TargetObjQueue {
    pub fn new(capacity: usize) -> Self {
        TargetObjQueue {
            ring: ArrayQueue::new(capacity),
            overflow: SegQueue::new(),
        }
    }

    /// Producer-side push; spills when the ring is full.
    pub fn push(&self, r: TargetRef) {
        if let Err(r) = self.ring.push(r) {
            self.overflow.push(r);
        }
    }

    /// Pop from the ring, but only while more than `threshold` entries
    /// remain so concurrent thieves are not starved. A zero threshold
    /// drains completely.
    pub fn pop_local(&self, threshold: usize) -> Option<TargetRef> {
        if self.ring.len() <= threshold {
            return None;
        }
        self.ring.pop()
    }

    /// Pop from the spill area.
    pub fn pop_overflow(&self) -> Option<TargetRef> {
        self.overflow.pop()
    }

    /// Move a spilled entry back into the ring if there is room.
    pub fn try_push_to_taskqueue(&self, r: TargetRef) -> Result<(), TargetRef> {
        self.ring.push(r)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty() && self.overflow.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ring.len() + self.overflow.len()
    }

    /// Discard all queued references; used on cycle abort and reclaim.
    pub fn set_empty(&self) {
        while self.ring.pop().is_some() {}
        while self.overflow.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> TargetRef {
        TargetRef::Full(ObjectRef::from_addr(HeapAddr::new(addr)).unwrap())
    }

    #[test]
    fn overflow_catches_ring_spill() {
        let q = TargetObjQueue::new(2);
        q.push(obj(0x1000));
        q.push(obj(0x2000));
        q.push(obj(0x3000)); // ring full, spills
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_overflow(), Some(obj(0x3000)));
        assert_eq!(q.pop_overflow(), None);
    }

    #[test]
    fn threshold_keeps_entries_for_thieves() {
        let q = TargetObjQueue::new(8);
        for i in 1..=4 {
            q.push(obj(i * 0x1000));
        }
        assert!(q.pop_local(3).is_some());
        assert_eq!(q.pop_local(3), None); // 3 left, at threshold
        assert!(q.pop_local(0).is_some());
    }

    #[test]
    fn narrow_refs_decode_against_heap_base() {
        let base = HeapAddr::new(0x10_0000);
        let obj = ObjectRef::from_addr(HeapAddr::new(0x10_0800)).unwrap();
        let narrow = TargetRef::narrow(obj, base);
        assert_eq!(narrow.decode(base), Some(obj));
        assert_eq!(TargetRef::Narrow(0).decode(base), None);
    }

    #[test]
    fn set_empty_clears_both_areas() {
        let q = TargetObjQueue::new(1);
        q.push(obj(0x1000));
        q.push(obj(0x2000));
        q.set_empty();
        assert!(q.is_empty());
    }
}
