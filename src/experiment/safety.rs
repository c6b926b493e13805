//! Interrupt and shutdown bookkeeping for sweeps.
//!
//! Hardware transactions cannot be aborted mid-flight, so cancellation is
//! cooperative: an [`InterruptFlag`] is raised from anywhere (typically a
//! Ctrl-C handler) and the sweep loop checks it between steps.
//!
//! A [`ShutdownLatch`] guards the device shutdown hook so that it fires
//! exactly once, whichever exit path reaches it first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

// =============================================================================
// Interrupt Flag
// =============================================================================

/// A shared flag for requesting a cooperative stop of the sweep.
///
/// Clones share the same flag.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag {
    flag: Arc<AtomicBool>,
    reason: Arc<RwLock<Option<String>>>,
}

impl InterruptFlag {
    /// Create a new, untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interrupt.
    pub fn trigger(&self, reason: impl Into<String>) {
        *self.reason.write() = Some(reason.into());
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if an interrupt was requested.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Reason given by the first caller of [`trigger`](Self::trigger).
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Clear the flag for a new run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
        *self.reason.write() = None;
    }
}

// =============================================================================
// Shutdown Latch
// =============================================================================

/// Where the shutdown hook was fired from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPath {
    /// End of a completed run
    Normal,
    /// An error or interrupt left the run
    ErrorExit,
    /// The controller was dropped without an explicit shutdown
    Fallback,
}

impl std::fmt::Display for ShutdownPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPath::Normal => write!(f, "normal completion"),
            ShutdownPath::ErrorExit => write!(f, "error exit"),
            ShutdownPath::Fallback => write!(f, "drop fallback"),
        }
    }
}

/// One-shot latch: only the first [`try_fire`](Self::try_fire) wins.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    fired: AtomicBool,
    path: RwLock<Option<ShutdownPath>>,
}

impl ShutdownLatch {
    /// Create an armed latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once, for the first caller.
    pub fn try_fire(&self, path: ShutdownPath) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.path.write() = Some(path);
        true
    }

    /// Whether the hook has fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Path that fired the hook, if any.
    pub fn fired_from(&self) -> Option<ShutdownPath> {
        *self.path.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_is_shared_between_clones() {
        let flag = InterruptFlag::new();
        let handler = flag.clone();
        assert!(!flag.is_triggered());

        handler.trigger("ctrl-c");
        assert!(flag.is_triggered());
        assert_eq!(flag.reason().as_deref(), Some("ctrl-c"));

        flag.reset();
        assert!(!handler.is_triggered());
        assert!(handler.reason().is_none());
    }

    #[test]
    fn latch_fires_once() {
        let latch = ShutdownLatch::new();
        assert!(latch.try_fire(ShutdownPath::ErrorExit));
        assert!(!latch.try_fire(ShutdownPath::Normal));
        assert!(!latch.try_fire(ShutdownPath::Fallback));
        assert_eq!(latch.fired_from(), Some(ShutdownPath::ErrorExit));
    }
}
