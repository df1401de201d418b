//! Abortable cyclic barrier for the overflow restart protocol.
//!
//! Two of these bracket the post-overflow reset: the first guarantees every
//! worker has stopped touching the shared marking structures, the second
//! releases them once worker 0 has reinitialized. An abort (full-collection
//! preemption) releases all current and future waiters with a failure
//! indication until the barrier is reset.

use parking_lot::{Condvar, Mutex};

struct BarrierState {
    n_workers: usize,
    arrived: usize,
    /// Incremented every time a cohort is released; waiters key on it so a
    /// late thread of generation g ignores wakeups for generation g+1.
    generation: u64,
    aborted: bool,
}

/// Cyclic, abortable rendezvous point.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use conmark::sync::WorkerBarrier;
///
/// let barrier = Arc::new(WorkerBarrier::new(2));
/// let other = Arc::clone(&barrier);
/// let t = std::thread::spawn(move || other.enter());
/// assert!(barrier.enter());
/// assert!(t.join().unwrap());
/// ```
pub struct WorkerBarrier {
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl WorkerBarrier {
    pub fn new(n_workers: usize) -> Self {
        WorkerBarrier {
            state: Mutex::new(BarrierState {
                n_workers,
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Change the cohort size. Only between phases, with no waiters parked.
    pub fn set_n_workers(&self, n_workers: usize) {
        let mut state = self.state.lock();
        assert!(state.arrived == 0, "resizing a barrier with waiters");
        state.n_workers = n_workers;
        state.aborted = false;
    }

    /// Block until `n_workers` threads have entered. Returns false when the
    /// barrier was aborted before the cohort completed.
    pub fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.arrived += 1;
        if state.arrived == state.n_workers {
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.cv.wait(&mut state);
        }
        !state.aborted
    }

    /// Release every waiter with a failure indication. The barrier stays
    /// aborted until [`Self::set_n_workers`] rearms it.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.arrived = 0;
        self.cv.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn cohort_of_three_synchronizes() {
        let barrier = Arc::new(WorkerBarrier::new(3));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let b = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || b.enter()));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn barrier_is_cyclic() {
        let barrier = Arc::new(WorkerBarrier::new(2));
        for _ in 0..3 {
            let b = Arc::clone(&barrier);
            let t = std::thread::spawn(move || b.enter());
            assert!(barrier.enter());
            assert!(t.join().unwrap());
        }
    }

    #[test]
    fn abort_releases_waiters_with_failure() {
        let barrier = Arc::new(WorkerBarrier::new(2));
        let b = Arc::clone(&barrier);
        let waiter = std::thread::spawn(move || b.enter());
        // Give the waiter time to park, then abort instead of joining.
        std::thread::sleep(std::time::Duration::from_millis(20));
        barrier.abort();
        assert!(!waiter.join().unwrap());
        // Late entries also observe the abort.
        assert!(!barrier.enter());
        // Rearming clears the abort.
        barrier.set_n_workers(1);
        assert!(barrier.enter());
    }
}
