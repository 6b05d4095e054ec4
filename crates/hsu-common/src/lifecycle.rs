//! Cooperative stop flag for `auto_update` loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag checked once per iteration of an update loop.
///
/// # Rust Learning Note
///
/// Servers and clients are single-threaded; the only thing another thread
/// (a signal handler, a test) may touch is this flag, so an `AtomicBool`
/// behind an `Arc` is all the synchronization needed.
///
/// ```rust
/// use hsu_common::StopHandle;
///
/// let stop = StopHandle::new();
/// let remote = stop.clone();
/// remote.stop();
/// assert!(stop.is_stopped());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
