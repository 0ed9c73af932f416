//! Small shared utilities.

pub mod clock;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide shutdown signal, checked at every loop boundary.
///
/// Set by the SIGTERM/Ctrl-C handler in `main`; long-running components
/// observe it between suspension points and exit after one final state save.
#[derive(Clone, Debug, Default)]
pub struct ShutdownFlag {
    flag: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
