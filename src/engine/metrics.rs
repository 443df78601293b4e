//! Read-only engine metrics

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Internal counters, updated lock-free from the pipeline and lock paths.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub fills_processed: AtomicU64,
    pub fill_processing_time_ms: AtomicU64,
    pub batches_executed: AtomicU64,
    pub lock_contention_events: AtomicU64,
    pub max_queue_depth: AtomicU64,
    pub queue_depth: AtomicU64,
    pub fill_processing_lock_active: AtomicBool,
    pub divergence_lock_active: AtomicBool,
    pub shadow_locks_active: AtomicU64,
    pub recent_fills_tracked: AtomicU64,
}

/// Point-in-time view handed to external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub fills_processed: u64,
    pub fill_processing_time_ms: u64,
    pub batches_executed: u64,
    pub lock_contention_events: u64,
    pub max_queue_depth: u64,
    pub queue_depth: u64,
    pub fill_processing_lock_active: bool,
    pub divergence_lock_active: bool,
    pub shadow_locks_active: u64,
    pub recent_fills_tracked: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new queue depth, tracking the high-water mark.
    pub fn record_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.max_queue_depth.fetch_max(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fills_processed: self.fills_processed.load(Ordering::Relaxed),
            fill_processing_time_ms: self.fill_processing_time_ms.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            lock_contention_events: self.lock_contention_events.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            fill_processing_lock_active: self.fill_processing_lock_active.load(Ordering::Relaxed),
            divergence_lock_active: self.divergence_lock_active.load(Ordering::Relaxed),
            shadow_locks_active: self.shadow_locks_active.load(Ordering::Relaxed),
            recent_fills_tracked: self.recent_fills_tracked.load(Ordering::Relaxed),
        }
    }
}
