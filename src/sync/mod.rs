//! Worker synchronization primitives: the overflow barrier pair, the
//! marking termination detector and the suspendible worker gate.

pub mod barrier;
pub mod suspend;
pub mod terminator;

pub use barrier::WorkerBarrier;
pub use suspend::SuspendibleSet;
pub use terminator::Terminator;
