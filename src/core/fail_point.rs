use std::sync::atomic::{AtomicBool, Ordering};

/// A named runtime toggle for forcing rarely taken paths in tests.
pub struct FailPoint {
    name: &'static str,
    enabled: AtomicBool,
}

impl FailPoint {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Notifies prepare-conflict waiters on every commit or abort, even when the
/// transaction was never prepared. Must stay enabled while randomized
/// prepare-conflict injection is in use: an injected conflict may belong to a
/// recovery unit that never actually reaches the prepared state.
pub static ALWAYS_NOTIFY_PREPARE_CONFLICT_WAITERS: FailPoint =
    FailPoint::new("alwaysNotifyPrepareConflictWaiters");
