//! Global overflow mark stack shared by all marking workers.
//!
//! Entries travel in fixed-size chunks: a worker that overflows its local
//! queue pushes one chunk, a worker that runs dry pops one. Two intrusive
//! chunk lists (in-use and free) are each guarded by their own mutex held
//! only long enough to splice a node; fresh chunks are claimed from a
//! budget by an atomic bump pointer.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::TaskEntry;

/// Entries per chunk. A partially filled chunk is terminated by
/// [`TaskEntry::NULL`].
pub const ENTRIES_PER_CHUNK: usize = 1024;

struct Chunk {
    data: Box<[TaskEntry; ENTRIES_PER_CHUNK]>,
    next: Option<Box<Chunk>>,
}

impl Chunk {
    fn new() -> Box<Chunk> {
        Box::new(Chunk {
            data: Box::new([TaskEntry::NULL; ENTRIES_PER_CHUNK]),
            next: None,
        })
    }
}

/// Growable chunked LIFO used for task-queue overflow.
///
/// # Examples
///
/// ```
/// use conmark::mark_stack::{MarkStack, ENTRIES_PER_CHUNK};
/// use conmark::object::{HeapAddr, ObjectRef, TaskEntry};
///
/// let stack = MarkStack::new(2, 4);
/// let mut buffer = [TaskEntry::NULL; ENTRIES_PER_CHUNK];
/// buffer[0] = TaskEntry::from_obj(ObjectRef::from_addr(HeapAddr::new(0x1000)).unwrap());
///
/// assert!(stack.par_push_chunk(&buffer));
/// assert!(!stack.is_empty());
///
/// let mut out = [TaskEntry::NULL; ENTRIES_PER_CHUNK];
/// assert!(stack.par_pop_chunk(&mut out));
/// assert_eq!(out[0], buffer[0]);
/// assert!(stack.is_empty());
/// ```
pub struct MarkStack {
    chunk_list: Mutex<Option<Box<Chunk>>>,
    free_list: Mutex<Option<Box<Chunk>>>,
    chunks_in_chunk_list: AtomicUsize,
    /// Chunks handed out from the budget so far; never decremented except
    /// by [`Self::set_empty`].
    hwm: AtomicUsize,
    chunk_capacity: AtomicUsize,
    max_chunk_capacity: usize,
}

impl MarkStack {
    /// Create a stack with an initial chunk budget, growable up to
    /// `max_chunks` by [`Self::expand`].
    pub fn new(initial_chunks: usize, max_chunks: usize) -> Self {
        assert!(
            initial_chunks >= 1 && initial_chunks <= max_chunks,
            "mark stack capacity {} must be within [1, {}]",
            initial_chunks,
            max_chunks
        );
        tracing::debug!(
            initial_chunks,
            max_chunks,
            "initialize global mark stack"
        );
        MarkStack {
            chunk_list: Mutex::new(None),
            free_list: Mutex::new(None),
            chunks_in_chunk_list: AtomicUsize::new(0),
            hwm: AtomicUsize::new(0),
            chunk_capacity: AtomicUsize::new(initial_chunks),
            max_chunk_capacity: max_chunks,
        }
    }

    fn allocate_new_chunk(&self) -> Option<Box<Chunk>> {
        // Dirty read is fine: hwm only grows, and the bounded overshoot
        // below keeps it from wrapping.
        let capacity = self.chunk_capacity.load(Ordering::Relaxed);
        if self.hwm.load(Ordering::Relaxed) >= capacity {
            return None;
        }
        let idx = self.hwm.fetch_add(1, Ordering::Relaxed);
        if idx >= capacity {
            return None;
        }
        Some(Chunk::new())
    }

    fn remove_chunk_from_free_list(&self) -> Option<Box<Chunk>> {
        let mut free = self.free_list.lock();
        let mut chunk = free.take()?;
        *free = chunk.next.take();
        Some(chunk)
    }

    fn add_chunk_to_free_list(&self, mut chunk: Box<Chunk>) {
        let mut free = self.free_list.lock();
        chunk.next = free.take();
        *free = Some(chunk);
    }

    fn remove_chunk_from_chunk_list(&self) -> Option<Box<Chunk>> {
        let mut list = self.chunk_list.lock();
        let mut chunk = list.take()?;
        *list = chunk.next.take();
        self.chunks_in_chunk_list.fetch_sub(1, Ordering::Relaxed);
        Some(chunk)
    }

    fn add_chunk_to_chunk_list(&self, mut chunk: Box<Chunk>) {
        let mut list = self.chunk_list.lock();
        chunk.next = list.take();
        *list = Some(chunk);
        self.chunks_in_chunk_list.fetch_add(1, Ordering::Relaxed);
    }

    /// Bulk-push one chunk's worth of entries. False when neither the free
    /// list nor the remaining budget can produce a chunk; the caller is
    /// expected to raise the global overflow.
    pub fn par_push_chunk(&self, entries: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let mut chunk = match self.remove_chunk_from_free_list() {
            Some(chunk) => chunk,
            None => match self.allocate_new_chunk() {
                Some(chunk) => chunk,
                None => return false,
            },
        };
        chunk.data.copy_from_slice(entries);
        self.add_chunk_to_chunk_list(chunk);
        true
    }

    /// Bulk-pop one chunk into `out`. False when no chunk is available.
    pub fn par_pop_chunk(&self, out: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let chunk = match self.remove_chunk_from_chunk_list() {
            Some(chunk) => chunk,
            None => return false,
        };
        out.copy_from_slice(&chunk.data[..]);
        self.add_chunk_to_free_list(chunk);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.chunks_in_chunk_list.load(Ordering::Relaxed) == 0
    }

    /// Best-effort entry count, used by the partial-drain target check.
    pub fn size_in_entries(&self) -> usize {
        self.chunks_in_chunk_list.load(Ordering::Relaxed) * ENTRIES_PER_CHUNK
    }

    pub fn chunks_in_use(&self) -> usize {
        self.chunks_in_chunk_list.load(Ordering::Relaxed)
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity.load(Ordering::Relaxed)
    }

    pub fn max_chunk_capacity(&self) -> usize {
        self.max_chunk_capacity
    }

    /// Double the chunk budget, capped at the configured maximum. Only legal
    /// while the stack is empty, after the overflow barriers have quiesced
    /// every worker.
    ///
    /// # Panics
    ///
    /// Already being at the maximum means the overflow cannot be resolved by
    /// growth; that exhausts the configured capacity and is fatal.
    pub fn expand(&self) {
        assert!(self.is_empty(), "only resize the mark stack when empty");
        let old = self.chunk_capacity.load(Ordering::Relaxed);
        if old == self.max_chunk_capacity {
            let err = crate::error::MarkError::MarkStackExpansionFailed { chunks: old };
            tracing::error!("{}", err);
            panic!("{}", err);
        }
        let new = (old * 2).min(self.max_chunk_capacity);
        self.chunk_capacity.store(new, Ordering::Relaxed);
        tracing::debug!(from = old, to = new, "expanded mark stack capacity");
    }

    /// Drop all chunks and reset the budget cursor. The backing budget
    /// (chunk_capacity) is retained.
    pub fn set_empty(&self) {
        *self.chunk_list.lock() = None;
        *self.free_list.lock() = None;
        self.chunks_in_chunk_list.store(0, Ordering::Relaxed);
        self.hwm.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapAddr, ObjectRef};

    fn full_buffer(base: usize) -> [TaskEntry; ENTRIES_PER_CHUNK] {
        let mut buf = [TaskEntry::NULL; ENTRIES_PER_CHUNK];
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot =
                TaskEntry::from_obj(ObjectRef::from_addr(HeapAddr::new(base + i * 8)).unwrap());
        }
        buf
    }

    #[test]
    fn push_pop_is_lifo_by_chunk() {
        let stack = MarkStack::new(4, 8);
        let a = full_buffer(0x10000);
        let b = full_buffer(0x20000);
        assert!(stack.par_push_chunk(&a));
        assert!(stack.par_push_chunk(&b));
        assert_eq!(stack.chunks_in_use(), 2);

        let mut out = [TaskEntry::NULL; ENTRIES_PER_CHUNK];
        assert!(stack.par_pop_chunk(&mut out));
        assert_eq!(out[0], b[0]);
        assert!(stack.par_pop_chunk(&mut out));
        assert_eq!(out[0], a[0]);
        assert!(!stack.par_pop_chunk(&mut out));
    }

    #[test]
    fn budget_exhaustion_reports_overflow() {
        let stack = MarkStack::new(1, 4);
        let buf = full_buffer(0x10000);
        assert!(stack.par_push_chunk(&buf));
        assert!(!stack.par_push_chunk(&buf));

        // Popping recycles the chunk through the free list.
        let mut out = [TaskEntry::NULL; ENTRIES_PER_CHUNK];
        assert!(stack.par_pop_chunk(&mut out));
        assert!(stack.par_push_chunk(&buf));
    }

    #[test]
    fn expand_doubles_up_to_max() {
        let stack = MarkStack::new(1, 4);
        stack.expand();
        assert_eq!(stack.chunk_capacity(), 2);
        stack.expand();
        assert_eq!(stack.chunk_capacity(), 4);
    }

    #[test]
    #[should_panic(expected = "cannot expand past")]
    fn expand_at_max_is_fatal() {
        let stack = MarkStack::new(2, 2);
        stack.expand();
    }

    #[test]
    fn set_empty_restores_full_budget() {
        let stack = MarkStack::new(1, 4);
        let buf = full_buffer(0x10000);
        assert!(stack.par_push_chunk(&buf));
        assert!(!stack.par_push_chunk(&buf));
        stack.set_empty();
        assert!(stack.is_empty());
        assert!(stack.par_push_chunk(&buf));
    }
}
