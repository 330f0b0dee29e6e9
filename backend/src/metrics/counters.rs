use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimal counters for operational visibility.
#[derive(Clone, Default, Debug)]
pub struct Counters {
    pub requests_submitted: Arc<AtomicU64>,
    pub units_enqueued: Arc<AtomicU64>,

    pub units_started: Arc<AtomicU64>,
    pub units_completed: Arc<AtomicU64>,
    pub units_failed: Arc<AtomicU64>,
    pub retries: Arc<AtomicU64>,

    // cycles that found nothing to do
    pub idle_cycles: Arc<AtomicU64>,
    pub skipped_entries: Arc<AtomicU64>,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
