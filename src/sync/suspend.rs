//! Suspendible worker gate.
//!
//! Marking workers join the set while running concurrently; a pause
//! requester synchronizes the set, which makes every joined worker park at
//! its next regular-clock call until the pause is over. Cancellation is
//! strictly cooperative: the requester only waits, it never interrupts.

use parking_lot::{Condvar, Mutex};

struct GateState {
    joined: usize,
    yielded: usize,
    suspended: bool,
}

/// Pause gate shared by the marking workers and the pause requester.
///
/// # Examples
///
/// ```
/// use conmark::sync::SuspendibleSet;
///
/// let set = SuspendibleSet::new();
/// set.join();
/// assert!(!set.should_yield());
/// set.leave();
///
/// // With nobody joined, a pause request completes immediately.
/// set.synchronize();
/// assert!(set.should_yield());
/// set.desynchronize();
/// ```
pub struct SuspendibleSet {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl Default for SuspendibleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendibleSet {
    pub fn new() -> Self {
        SuspendibleSet {
            state: Mutex::new(GateState {
                joined: 0,
                yielded: 0,
                suspended: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Enter the set. While joined, the worker must poll
    /// [`Self::should_yield`] and call [`Self::yield_now`] promptly.
    pub fn join(&self) {
        let mut state = self.state.lock();
        // A pause may be forming; do not join in the middle of it.
        while state.suspended {
            self.cv.wait(&mut state);
        }
        state.joined += 1;
    }

    /// Leave the set, unblocking a pause requester waiting on us.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        assert!(state.joined > 0, "leaving without joining");
        state.joined -= 1;
        self.cv.notify_all();
    }

    /// True when a pause has been requested and the caller should yield.
    pub fn should_yield(&self) -> bool {
        self.state.lock().suspended
    }

    /// Park until the pause is over. Must only be called when
    /// [`Self::should_yield`] returned true.
    pub fn yield_now(&self) {
        let mut state = self.state.lock();
        if !state.suspended {
            return;
        }
        state.yielded += 1;
        self.cv.notify_all();
        while state.suspended {
            self.cv.wait(&mut state);
        }
        state.yielded -= 1;
    }

    /// Request a pause and wait until every joined worker has either
    /// yielded or left the set.
    pub fn synchronize(&self) {
        let mut state = self.state.lock();
        assert!(!state.suspended, "nested synchronize");
        state.suspended = true;
        while state.yielded < state.joined {
            self.cv.wait(&mut state);
        }
    }

    /// End the pause and release the yielded workers.
    pub fn desynchronize(&self) {
        let mut state = self.state.lock();
        assert!(state.suspended, "desynchronize without synchronize");
        state.suspended = false;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn pause_waits_for_workers_to_yield() {
        let set = Arc::new(SuspendibleSet::new());
        let stop = Arc::new(AtomicBool::new(false));
        let paused_once = Arc::new(AtomicBool::new(false));

        let worker = {
            let set = Arc::clone(&set);
            let stop = Arc::clone(&stop);
            let paused_once = Arc::clone(&paused_once);
            std::thread::spawn(move || {
                set.join();
                while !stop.load(Ordering::Relaxed) {
                    if set.should_yield() {
                        paused_once.store(true, Ordering::Relaxed);
                        set.yield_now();
                    }
                    std::hint::spin_loop();
                }
                set.leave();
            })
        };

        set.synchronize();
        // The pause request only returns once the worker yielded.
        assert!(paused_once.load(Ordering::Relaxed));
        set.desynchronize();

        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();
    }

    #[test]
    fn leaving_also_satisfies_a_pause() {
        let set = Arc::new(SuspendibleSet::new());
        set.join();
        let requester = {
            let set = Arc::clone(&set);
            std::thread::spawn(move || {
                set.synchronize();
                set.desynchronize();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        set.leave();
        requester.join().unwrap();
    }
}
