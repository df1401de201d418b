//! Per-worker bounded work queue with lock-free stealing.
//!
//! The owner pushes and pops LIFO at one end; thieves take FIFO from the
//! other, Chase–Lev style, through [`crossbeam_deque`]. The deque itself is
//! unbounded, so capacity is enforced by a shared best-effort counter: the
//! owner spills to the global mark stack when the counter reaches the
//! configured bound.

use std::sync::Arc;

use crossbeam_deque::{Steal, Stealer, Worker};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::TaskEntry;

struct QueueShared {
    size: CachePadded<AtomicUsize>,
}

/// Owner side of one worker's task queue.
///
/// # Examples
///
/// ```
/// use conmark::object::{HeapAddr, ObjectRef, TaskEntry};
/// use conmark::task_queue::TaskQueue;
///
/// let queue = TaskQueue::new(2);
/// let stealer = queue.stealer();
/// let a = TaskEntry::from_obj(ObjectRef::from_addr(HeapAddr::new(0x1000)).unwrap());
/// let b = TaskEntry::from_obj(ObjectRef::from_addr(HeapAddr::new(0x2000)).unwrap());
///
/// assert!(queue.push(a));
/// assert!(queue.push(b));
/// assert!(!queue.push(a)); // full: caller spills to the global stack
///
/// // Owner pops newest-first, thief steals oldest-first.
/// assert_eq!(queue.pop_local(), Some(b));
/// assert_eq!(stealer.steal(), Some(a));
/// ```
pub struct TaskQueue {
    worker: Worker<TaskEntry>,
    shared: Arc<QueueShared>,
    capacity: usize,
}

/// Thief handle onto another worker's queue.
#[derive(Clone)]
pub struct TaskQueueStealer {
    stealer: Stealer<TaskEntry>,
    shared: Arc<QueueShared>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        TaskQueue {
            worker: Worker::new_lifo(),
            shared: Arc::new(QueueShared {
                size: CachePadded::new(AtomicUsize::new(0)),
            }),
            capacity,
        }
    }

    /// Maximum entries the owner may hold before spilling.
    #[inline]
    pub fn max_elems(&self) -> usize {
        self.capacity
    }

    /// Owner-only push. False when the queue is at capacity.
    #[inline]
    pub fn push(&self, entry: TaskEntry) -> bool {
        if self.shared.size.load(Ordering::Relaxed) >= self.capacity {
            return false;
        }
        self.worker.push(entry);
        self.shared.size.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Owner-only LIFO pop.
    #[inline]
    pub fn pop_local(&self) -> Option<TaskEntry> {
        let entry = self.worker.pop();
        if entry.is_some() {
            decrement(&self.shared);
        }
        entry
    }

    /// Best-effort entry count; racy by design.
    #[inline]
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    /// Drop everything still queued. Owner-only; used when a cycle aborts
    /// or restarts after overflow.
    pub fn set_empty(&self) {
        while self.worker.pop().is_some() {
            decrement(&self.shared);
        }
        self.shared.size.store(0, Ordering::Relaxed);
    }

    /// Handle other workers use to steal from this queue.
    pub fn stealer(&self) -> TaskQueueStealer {
        TaskQueueStealer {
            stealer: self.worker.stealer(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl TaskQueueStealer {
    /// Steal one entry from the victim's FIFO end. A `None` does not prove
    /// the queue is empty; contention produces spurious misses.
    pub fn steal(&self) -> Option<TaskEntry> {
        let mut retries = 0;
        loop {
            match self.stealer.steal() {
                Steal::Success(entry) => {
                    decrement(&self.shared);
                    return Some(entry);
                }
                Steal::Empty => return None,
                Steal::Retry => {
                    retries += 1;
                    if retries > 3 {
                        return None;
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }
}

#[inline]
fn decrement(shared: &QueueShared) {
    // Saturating: steals race with the owner's set_empty reset.
    let _ = shared
        .size
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapAddr, ObjectRef};

    fn entry(addr: usize) -> TaskEntry {
        TaskEntry::from_obj(ObjectRef::from_addr(HeapAddr::new(addr)).unwrap())
    }

    #[test]
    fn push_respects_capacity() {
        let q = TaskQueue::new(3);
        assert!(q.push(entry(0x1000)));
        assert!(q.push(entry(0x2000)));
        assert!(q.push(entry(0x3000)));
        assert!(!q.push(entry(0x4000)));
        assert_eq!(q.size(), 3);
    }

    #[test]
    fn owner_pops_lifo_thief_steals_fifo() {
        let q = TaskQueue::new(16);
        let s = q.stealer();
        for i in 1..=3 {
            q.push(entry(i * 0x1000));
        }
        assert_eq!(s.steal(), Some(entry(0x1000)));
        assert_eq!(q.pop_local(), Some(entry(0x3000)));
        assert_eq!(q.pop_local(), Some(entry(0x2000)));
        assert_eq!(q.pop_local(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn set_empty_discards_and_resets_size() {
        let q = TaskQueue::new(8);
        for i in 1..=5 {
            q.push(entry(i * 0x1000));
        }
        q.set_empty();
        assert!(q.is_empty());
        assert_eq!(q.size(), 0);
        assert!(q.push(entry(0x1000)));
    }

    #[test]
    fn concurrent_steals_never_duplicate() {
        use std::collections::HashSet;
        use std::sync::Mutex;

        let q = Arc::new(TaskQueue::new(4096));
        for i in 1..=2000 {
            q.push(entry(i * 8 + 0x10000));
        }
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = q.stealer();
            let seen = Arc::clone(&seen);
            handles.push(std::thread::spawn(move || {
                let mut misses = 0;
                while misses < 100 {
                    match s.steal() {
                        Some(e) => {
                            assert!(seen.lock().unwrap().insert(e.as_obj().unwrap().addr()));
                            misses = 0;
                        }
                        None => misses += 1,
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 2000);
    }
}
