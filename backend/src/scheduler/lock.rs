use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide "a unit is being worked or cooling down" flag.
///
/// `try_acquire` checks and sets in one compare-exchange, so two concurrent
/// cycles can never both observe the lock as free.
#[derive(Debug, Default)]
pub struct ProcessingLock {
    held: AtomicBool,
}

impl ProcessingLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the caller now owns the lock.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}
