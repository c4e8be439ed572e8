//! Counters for worker pool activity.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Thread-safe counters updated by every worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    completed: AtomicUsize,
    cached: AtomicUsize,
    failed: AtomicUsize,
    requeued: AtomicUsize,
    retried: AtomicUsize,
    circuit_rejections: AtomicUsize,
    cancelled: AtomicUsize,
}

/// Plain copy of [`WorkerStats`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Tasks completed from the source.
    pub completed: usize,
    /// Tasks served from a completed cache entry.
    pub cached: usize,
    /// Tasks that reached FAILED.
    pub failed: usize,
    /// Failures sent back to the queue for another run.
    pub requeued: usize,
    /// In-worker retry attempts.
    pub retried: usize,
    /// Attempts rejected by an open circuit breaker.
    pub circuit_rejections: usize,
    /// Tasks abandoned because they were cancelled while claimed.
    pub cancelled: usize,
}

impl WorkerStats {
    /// Creates a stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks completed from the source.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks served from cache.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cached.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks that failed permanently.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the number of queue-level requeues.
    #[must_use]
    pub fn requeued(&self) -> usize {
        self.requeued.load(Ordering::SeqCst)
    }

    /// Returns the number of in-worker retry attempts made.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Returns the number of breaker rejections.
    #[must_use]
    pub fn circuit_rejections(&self) -> usize {
        self.circuit_rejections.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks abandoned after cancellation.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the number of tasks that reached a terminal outcome in a worker.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.cached() + self.failed()
    }

    /// Copies all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed(),
            cached: self.cached(),
            failed: self.failed(),
            requeued: self.requeued(),
            retried: self.retried(),
            circuit_rejections: self.circuit_rejections(),
            cancelled: self.cancelled(),
        }
    }

    pub(crate) fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_cached(&self) {
        self.cached.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_circuit_rejections(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}
