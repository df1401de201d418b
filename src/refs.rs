//! Weak-reference discovery drain.
//!
//! The engine carries no reference-processing policy of its own: references
//! discovered during the cycle are simply funneled through the marker's
//! keep-alive path at remark, followed by a full drain. Policy (soft
//! reference aging, clearing) belongs to the embedder.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::object::ObjectRef;

/// Discovered-reference lists and the remark drain over them.
///
/// # Examples
///
/// ```
/// use conmark::object::{HeapAddr, ObjectRef};
/// use conmark::refs::ReferenceProcessor;
///
/// let rp = ReferenceProcessor::new();
/// rp.enable_discovery();
/// rp.discover(ObjectRef::from_addr(HeapAddr::new(0x1000)).unwrap());
///
/// let mut kept = Vec::new();
/// rp.process_discovered_references(&|_| false, &mut |r| kept.push(r), &mut || ());
/// assert_eq!(kept.len(), 1);
/// assert!(!rp.discovery_enabled());
/// ```
pub struct ReferenceProcessor {
    discovery_enabled: AtomicBool,
    clear_all_soft: AtomicBool,
    discovered: SegQueue<ObjectRef>,
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        ReferenceProcessor {
            discovery_enabled: AtomicBool::new(false),
            clear_all_soft: AtomicBool::new(false),
            discovered: SegQueue::new(),
        }
    }

    pub fn enable_discovery(&self) {
        self.discovery_enabled.store(true, Ordering::Release);
    }

    pub fn discovery_enabled(&self) -> bool {
        self.discovery_enabled.load(Ordering::Acquire)
    }

    /// Snapshot the soft-reference policy for this cycle.
    pub fn setup_policy(&self, clear_all_soft: bool) {
        self.clear_all_soft.store(clear_all_soft, Ordering::Release);
    }

    /// Record a reference whose referent's liveness must be settled at
    /// remark. Ignored while discovery is disabled.
    pub fn discover(&self, reference: ObjectRef) {
        if self.discovery_enabled() {
            self.discovered.push(reference);
        }
    }

    pub fn num_discovered(&self) -> usize {
        self.discovered.len()
    }

    /// Drain the discovered lists: every referent that `is_alive` rejects
    /// is handed to `keep_alive`, then `complete_gc` runs the marker until
    /// the newly kept references are fully traced. Discovery ends here.
    pub fn process_discovered_references(
        &self,
        is_alive: &dyn Fn(ObjectRef) -> bool,
        keep_alive: &mut dyn FnMut(ObjectRef),
        complete_gc: &mut dyn FnMut(),
    ) {
        while let Some(reference) = self.discovered.pop() {
            if !is_alive(reference) {
                keep_alive(reference);
            }
        }
        complete_gc();
        self.discovery_enabled.store(false, Ordering::Release);
    }

    /// Drop everything discovered so far, e.g. on cycle abort.
    pub fn abandon_discovery(&self) {
        while self.discovered.pop().is_some() {}
        self.discovery_enabled.store(false, Ordering::Release);
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
    fn discovery_requires_enablement() {
        let rp = ReferenceProcessor::new();
        rp.discover(obj(0x1000));
        assert_eq!(rp.num_discovered(), 0);
        rp.enable_discovery();
        rp.discover(obj(0x1000));
        assert_eq!(rp.num_discovered(), 1);
    }

    #[test]
    fn live_referents_are_not_kept_alive() {
        let rp = ReferenceProcessor::new();
        rp.enable_discovery();
        rp.discover(obj(0x1000));
        rp.discover(obj(0x2000));

        let mut kept = Vec::new();
        let mut drained = false;
        rp.process_discovered_references(
            &|r| r == obj(0x1000),
            &mut |r| kept.push(r),
            &mut || drained = true,
        );
        assert_eq!(kept, vec![obj(0x2000)]);
        assert!(drained);
    }
}
