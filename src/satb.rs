//! Snapshot-at-the-beginning producer buffers.
//!
//! Mutator threads log pre-write references here while marking is active;
//! the engine only consumes. Each producer fills a small per-thread buffer
//! that is handed over to the completed list when full; remark drains the
//! per-thread remainders and every completed buffer.

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::object::ObjectRef;

/// The producer-buffer set for one marking engine.
///
/// # Examples
///
/// ```
/// use conmark::object::{HeapAddr, ObjectRef};
/// use conmark::satb::SatbBufferSet;
///
/// let satb = SatbBufferSet::new(2, 1);
/// satb.set_active_all_threads(true, false);
///
/// let obj = ObjectRef::from_addr(HeapAddr::new(0x1000)).unwrap();
/// satb.enqueue(7, obj);
/// satb.enqueue(7, obj); // buffer full: handed to the completed list
/// assert_eq!(satb.completed_buffers_num(), 1);
///
/// let mut seen = 0;
/// assert!(satb.apply_closure_to_completed_buffer(&mut |_| seen += 1));
/// assert_eq!(seen, 2);
/// ```
pub struct SatbBufferSet {
    active: AtomicBool,
    buffer_capacity: usize,
    process_threshold: usize,
    thread_buffers: DashMap<u64, Mutex<Vec<ObjectRef>>>,
    completed: SegQueue<Vec<ObjectRef>>,
    completed_count: AtomicUsize,
}

impl SatbBufferSet {
    pub fn new(buffer_capacity: usize, process_threshold: usize) -> Self {
        SatbBufferSet {
            active: AtomicBool::new(false),
            buffer_capacity,
            process_threshold,
            thread_buffers: DashMap::new(),
            completed: SegQueue::new(),
            completed_count: AtomicUsize::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Toggle logging for all producer threads. `expected` asserts the
    /// transition direction, catching phase sequencing mistakes.
    pub fn set_active_all_threads(&self, active: bool, expected: bool) {
        let was = self.active.swap(active, Ordering::AcqRel);
        assert_eq!(was, expected, "producer buffers were in an unexpected state");
    }

    /// Producer-side entry point: log a pre-write reference.
    pub fn enqueue(&self, thread_id: u64, obj: ObjectRef) {
        if !self.is_active() {
            return;
        }
        let entry = self
            .thread_buffers
            .entry(thread_id)
            .or_insert_with(|| Mutex::new(Vec::with_capacity(self.buffer_capacity)));
        let mut buffer = entry.lock();
        buffer.push(obj);
        if buffer.len() >= self.buffer_capacity {
            let full = std::mem::replace(
                &mut *buffer,
                Vec::with_capacity(self.buffer_capacity),
            );
            self.completed.push(full);
            self.completed_count.fetch_add(1, Ordering::Release);
        }
    }

    pub fn completed_buffers_num(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Whether enough completed buffers are queued that a concurrent step
    /// should abort and go process them.
    pub fn process_completed_buffers(&self) -> bool {
        self.completed_buffers_num() >= self.process_threshold
    }

    /// Claim one completed buffer and apply `f` to each entry. False when
    /// none were available.
    pub fn apply_closure_to_completed_buffer(
        &self,
        f: &mut dyn FnMut(ObjectRef),
    ) -> bool {
        let buffer = match self.completed.pop() {
            Some(buffer) => buffer,
            None => return false,
        };
        self.completed_count.fetch_sub(1, Ordering::Release);
        for obj in buffer {
            f(obj);
        }
        true
    }

    /// Drain one producer thread's partial buffer through `f`.
    pub fn apply_closure_and_empty(&self, thread_id: u64, f: &mut dyn FnMut(ObjectRef)) {
        if let Some(entry) = self.thread_buffers.get(&thread_id) {
            let mut buffer = entry.lock();
            for obj in buffer.drain(..) {
                f(obj);
            }
        }
    }

    /// Producer thread ids with a non-empty partial buffer.
    pub fn threads_with_buffers(&self) -> Vec<u64> {
        self.thread_buffers
            .iter()
            .filter(|entry| !entry.value().lock().is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Throw away all logged references, partial and completed. Used when
    /// the cycle aborts and the snapshot is worthless.
    pub fn abandon_partial_marking(&self) {
        for entry in self.thread_buffers.iter() {
            entry.value().lock().clear();
        }
        while self.completed.pop().is_some() {
            self.completed_count.fetch_sub(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HeapAddr;

    fn obj(addr: usize) -> ObjectRef {
        ObjectRef::from_addr(HeapAddr::new(addr)).unwrap()
    }

    #[test]
    fn inactive_set_drops_enqueues() {
        let satb = SatbBufferSet::new(4, 1);
        satb.enqueue(1, obj(0x1000));
        assert_eq!(satb.completed_buffers_num(), 0);
        assert!(satb.threads_with_buffers().is_empty());
    }

    #[test]
    fn full_buffers_move_to_completed_list() {
        let satb = SatbBufferSet::new(2, 2);
        satb.set_active_all_threads(true, false);
        for i in 1..=5 {
            satb.enqueue(1, obj(i * 0x1000));
        }
        assert_eq!(satb.completed_buffers_num(), 2);
        assert!(satb.process_completed_buffers());

        // One entry still sits in the partial buffer.
        let mut partial = Vec::new();
        satb.apply_closure_and_empty(1, &mut |o| partial.push(o));
        assert_eq!(partial, vec![obj(0x5000)]);
    }

    #[test]
    #[should_panic(expected = "unexpected state")]
    fn activation_asserts_expected_state() {
        let satb = SatbBufferSet::new(4, 1);
        satb.set_active_all_threads(true, true);
    }

    #[test]
    fn abandon_discards_everything() {
        let satb = SatbBufferSet::new(2, 1);
        satb.set_active_all_threads(true, false);
        for i in 1..=4 {
            satb.enqueue(i, obj(i as usize * 0x1000));
        }
        satb.abandon_partial_marking();
        assert_eq!(satb.completed_buffers_num(), 0);
        assert!(satb.threads_with_buffers().is_empty());
        assert!(!satb.apply_closure_to_completed_buffer(&mut |_| ()));
    }
}
