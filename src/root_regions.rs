//! Distribution of root regions to scan workers.
//!
//! At cycle start the coordinator publishes the survivor and old regions
//! whose contents seed this cycle's marking. Workers claim them one at a
//! time with a fetch-and-add; whoever needs the scan results blocks on a
//! condition variable until the last claim is processed.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::heap::RegionIdx;

/// Claimable set of root regions for one marking cycle.
///
/// # Examples
///
/// ```
/// use conmark::heap::RegionIdx;
/// use conmark::root_regions::RootRegionClaimer;
///
/// let roots = RootRegionClaimer::new(8);
/// roots.add(RegionIdx::new(2));
/// roots.add(RegionIdx::new(5));
/// roots.prepare_for_scan();
///
/// assert_eq!(roots.claim_next(), Some(RegionIdx::new(2)));
/// assert_eq!(roots.claim_next(), Some(RegionIdx::new(5)));
/// assert_eq!(roots.claim_next(), None);
/// roots.scan_finished();
/// assert!(!roots.scan_in_progress());
/// ```
pub struct RootRegionClaimer {
    root_regions: Mutex<Vec<RegionIdx>>,
    max_regions: usize,
    num_root_regions: AtomicUsize,
    claimed_root_regions: AtomicUsize,
    scan_in_progress: AtomicBool,
    should_abort: AtomicBool,
    scan_done_lock: Mutex<()>,
    scan_done_cv: Condvar,
}

impl RootRegionClaimer {
    pub fn new(max_regions: usize) -> Self {
        RootRegionClaimer {
            root_regions: Mutex::new(Vec::with_capacity(max_regions)),
            max_regions,
            num_root_regions: AtomicUsize::new(0),
            claimed_root_regions: AtomicUsize::new(0),
            scan_in_progress: AtomicBool::new(false),
            should_abort: AtomicBool::new(false),
            scan_done_lock: Mutex::new(()),
            scan_done_cv: Condvar::new(),
        }
    }

    /// Forget last cycle's set. Only between cycles.
    pub fn reset(&self) {
        self.root_regions.lock().clear();
        self.num_root_regions.store(0, Ordering::Release);
    }

    /// Publish a root region. Only during the initial-mark pause.
    pub fn add(&self, idx: RegionIdx) {
        let mut regions = self.root_regions.lock();
        assert!(
            regions.len() < self.max_regions,
            "adding more root regions than there is space {}",
            self.max_regions
        );
        regions.push(idx);
        self.num_root_regions.fetch_add(1, Ordering::Release);
    }

    pub fn prepare_for_scan(&self) {
        assert!(!self.scan_in_progress(), "scan already in progress");
        self.scan_in_progress.store(
            self.num_root_regions.load(Ordering::Acquire) > 0,
            Ordering::Release,
        );
        self.claimed_root_regions.store(0, Ordering::Release);
        self.should_abort.store(false, Ordering::Release);
    }

    /// Claim the next unscanned root region; `None` once all are claimed or
    /// the scan was cancelled.
    pub fn claim_next(&self) -> Option<RegionIdx> {
        if self.should_abort.load(Ordering::Acquire) {
            return None;
        }
        let num = self.num_root_regions.load(Ordering::Acquire);
        if self.claimed_root_regions.load(Ordering::Acquire) >= num {
            return None;
        }
        let claimed = self.claimed_root_regions.fetch_add(1, Ordering::AcqRel);
        if claimed < num {
            Some(self.root_regions.lock()[claimed])
        } else {
            None
        }
    }

    pub fn num_root_regions(&self) -> usize {
        self.num_root_regions.load(Ordering::Acquire)
    }

    pub fn scan_in_progress(&self) -> bool {
        self.scan_in_progress.load(Ordering::Acquire)
    }

    fn notify_scan_done(&self) {
        let _guard = self.scan_done_lock.lock();
        self.scan_in_progress.store(false, Ordering::Release);
        self.scan_done_cv.notify_all();
    }

    /// Stop handing out regions and release any waiters.
    pub fn cancel_scan(&self) {
        self.should_abort.store(true, Ordering::Release);
        self.notify_scan_done();
    }

    /// Mark the scan phase complete. All regions must have been claimed
    /// unless the scan was cancelled.
    pub fn scan_finished(&self) {
        assert!(self.scan_in_progress(), "no scan in progress");
        if !self.should_abort.load(Ordering::Acquire) {
            assert!(
                self.claimed_root_regions.load(Ordering::Acquire) >= self.num_root_regions(),
                "not all root regions were claimed"
            );
        }
        self.notify_scan_done();
    }

    /// Block until the scan completes. Returns false when no scan was in
    /// progress to begin with.
    pub fn wait_until_scan_finished(&self) -> bool {
        if !self.scan_in_progress() {
            return false;
        }
        let mut guard = self.scan_done_lock.lock();
        while self.scan_in_progress() {
            self.scan_done_cv.wait(&mut guard);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn each_region_claimed_exactly_once() {
        let claimer = Arc::new(RootRegionClaimer::new(64));
        for i in 0..40 {
            claimer.add(RegionIdx::new(i));
        }
        claimer.prepare_for_scan();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let claimer = Arc::clone(&claimer);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                while let Some(idx) = claimer.claim_next() {
                    mine.push(idx.raw());
                }
                mine
            }));
        }
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..40).collect::<Vec<_>>());
        claimer.scan_finished();
    }

    #[test]
    fn cancel_unblocks_waiters() {
        let claimer = Arc::new(RootRegionClaimer::new(4));
        claimer.add(RegionIdx::new(0));
        claimer.prepare_for_scan();

        let waiter = {
            let claimer = Arc::clone(&claimer);
            std::thread::spawn(move || claimer.wait_until_scan_finished())
        };
        claimer.cancel_scan();
        assert!(waiter.join().unwrap());
        assert_eq!(claimer.claim_next(), None);
    }

    #[test]
    fn empty_set_never_enters_scan() {
        let claimer = RootRegionClaimer::new(4);
        claimer.prepare_for_scan();
        assert!(!claimer.scan_in_progress());
        assert!(!claimer.wait_until_scan_finished());
    }
}
