//! Non-blocking termination detection for the marking workers.
//!
//! A worker that has drained everything it can find offers termination.
//! Offers are counted toward the active worker count; while waiting, each
//! worker keeps re-polling its own exit predicate (work reappeared on the
//! global stack, an abort, a failed clock). A worker whose predicate fires
//! withdraws its offer and returns to stealing; the phase ends only when
//! every worker's offer stands at once.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Offer/count/re-poll termination detector.
///
/// `offer_termination` never touches the shared work structures; the exit
/// predicate passed by the caller only reads them.
///
/// # Examples
///
/// ```
/// use conmark::sync::Terminator;
///
/// let terminator = Terminator::new(1);
/// // A single worker with nothing to re-check terminates immediately.
/// assert!(terminator.offer_termination(|| false));
/// ```
pub struct Terminator {
    n_workers: AtomicUsize,
    offered: AtomicUsize,
    completed: AtomicBool,
}

impl Terminator {
    pub fn new(n_workers: usize) -> Self {
        Terminator {
            n_workers: AtomicUsize::new(n_workers),
            offered: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
        }
    }

    /// Rearm for a new phase with `n_workers` participants.
    pub fn reset_for_reuse(&self, n_workers: usize) {
        self.n_workers.store(n_workers, Ordering::Release);
        self.offered.store(0, Ordering::Release);
        self.completed.store(false, Ordering::Release);
    }

    /// Offer to terminate. Returns true when all workers agreed and the
    /// phase is over; false when `should_exit` fired and the caller must go
    /// back to look for work (or observe its abort condition).
    pub fn offer_termination(&self, mut should_exit: impl FnMut() -> bool) -> bool {
        let n = self.n_workers.load(Ordering::Acquire);
        let offered = self.offered.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(offered <= n, "more offers than active workers");

        if offered == n {
            // Would-be-last offer: one final poll before declaring the
            // phase complete, so work pushed just before our offer is not
            // stranded.
            if should_exit() {
                self.offered.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            self.completed.store(true, Ordering::Release);
            return true;
        }

        let backoff = Backoff::new();
        loop {
            if self.completed.load(Ordering::Acquire) {
                return true;
            }
            if should_exit() {
                // Withdraw; unless everyone completed in the meantime.
                if self.completed.load(Ordering::Acquire) {
                    return true;
                }
                self.offered.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            backoff.snooze();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn all_workers_terminate_together() {
        let terminator = Arc::new(Terminator::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = Arc::clone(&terminator);
            handles.push(std::thread::spawn(move || t.offer_termination(|| false)));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert!(terminator.is_completed());
    }

    #[test]
    fn reappearing_work_withdraws_an_offer() {
        let terminator = Arc::new(Terminator::new(2));
        let work_available = Arc::new(AtomicBool::new(true));

        // First worker offers while "work" is visible; its predicate fires
        // and it withdraws.
        {
            let t = Arc::clone(&terminator);
            let w = Arc::clone(&work_available);
            assert!(!t.offer_termination(|| w.load(Ordering::Relaxed)));
        }

        // Work drained; both workers offer and terminate.
        work_available.store(false, Ordering::Relaxed);
        let t2 = Arc::clone(&terminator);
        let handle = std::thread::spawn(move || t2.offer_termination(|| false));
        assert!(terminator.offer_termination(|| false));
        assert!(handle.join().unwrap());
    }

    #[test]
    fn reuse_after_reset() {
        let terminator = Terminator::new(1);
        assert!(terminator.offer_termination(|| false));
        terminator.reset_for_reuse(1);
        assert!(!terminator.is_completed());
        assert!(terminator.offer_termination(|| false));
    }
}
