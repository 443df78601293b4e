//! Fill-event pipeline state: queue, dedup window, stale-cleaned ledger
//!
//! The listener task pushes raw event batches; a single consumer (driven by
//! the engine under the fill-processing lock) drains them. All three maps
//! use plain mutexes: nothing awaits while holding them.

pub mod batch;

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::chain::types::FillEvent;
use crate::consts::{
    FILL_CLEANUP_INTERVAL_MS, FILL_DEDUPE_WINDOW_MS, STALE_CLEANED_MIN_RETENTION_MS,
};

/// Wall-clock milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Retention window of the stale-cleaned ledger.
pub fn stale_retention_ms() -> u64 {
    FILL_DEDUPE_WINDOW_MS.max(STALE_CLEANED_MIN_RETENTION_MS)
}

/// Shared pipeline state.
#[derive(Debug, Default)]
pub struct FillPipeline {
    queue: Mutex<VecDeque<FillEvent>>,
    /// Dedup key -> last-seen ms.
    recent_fills: Mutex<HashMap<String, u64>>,
    /// Chain order id -> marked-at ms. Orders whose slot funds were already
    /// released by batch-failure cleanup; fills for them must not re-credit.
    stale_cleaned: Mutex<HashMap<String, u64>>,
}

impl FillPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    // --- queue ---------------------------------------------------------------

    /// Enqueue a batch of raw events; returns the new queue depth.
    pub fn push(&self, events: Vec<FillEvent>) -> usize {
        let mut queue = self.queue.lock().unwrap();
        queue.extend(events);
        queue.len()
    }

    /// Atomically take everything currently queued, preserving order.
    pub fn drain(&self) -> Vec<FillEvent> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    // --- dedup ---------------------------------------------------------------

    /// Record-and-test: true when the event has not been seen within the
    /// dedup window. Accepted keys are recorded at `now`.
    pub fn should_process(&self, dedup_key: &str, now: u64) -> bool {
        let mut recent = self.recent_fills.lock().unwrap();
        if let Some(last_seen) = recent.get(dedup_key) {
            if now.saturating_sub(*last_seen) < FILL_DEDUPE_WINDOW_MS {
                return false;
            }
        }
        recent.insert(dedup_key.to_string(), now);
        true
    }

    /// Drop dedup entries older than the cleanup interval.
    pub fn evict_expired(&self, now: u64) {
        self.recent_fills
            .lock()
            .unwrap()
            .retain(|_, seen| now.saturating_sub(*seen) < FILL_CLEANUP_INTERVAL_MS);
    }

    pub fn recent_fills_tracked(&self) -> usize {
        self.recent_fills.lock().unwrap().len()
    }

    /// Snapshot of the dedup cache for persistence.
    pub fn processed_fills_snapshot(&self) -> HashMap<String, u64> {
        self.recent_fills.lock().unwrap().clone()
    }

    /// Restore the dedup cache from a persisted snapshot.
    pub fn restore_processed_fills(&self, map: HashMap<String, u64>) {
        *self.recent_fills.lock().unwrap() = map;
    }

    // --- stale-cleaned ledger ------------------------------------------------

    /// Record that an order's slot funds were released by failure cleanup.
    pub fn mark_stale_cleaned(&self, order_id: &str, now: u64) {
        self.stale_cleaned
            .lock()
            .unwrap()
            .insert(order_id.to_string(), now);
    }

    /// Whether fills for this order id must be skipped (funds already
    /// released and the entry is still within retention).
    pub fn is_stale_cleaned(&self, order_id: &str, now: u64) -> bool {
        let ledger = self.stale_cleaned.lock().unwrap();
        match ledger.get(order_id) {
            Some(marked) => now.saturating_sub(*marked) < stale_retention_ms(),
            None => false,
        }
    }

    /// Drop expired ledger entries.
    pub fn prune_stale_cleaned(&self, now: u64) {
        self.stale_cleaned
            .lock()
            .unwrap()
            .retain(|_, marked| now.saturating_sub(*marked) < stale_retention_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::{AssetAmount, FillOp};

    fn event(order_id: &str, block: u64, id: &str) -> FillEvent {
        FillEvent::order_match(
            FillOp {
                order_id: order_id.into(),
                pays: AssetAmount {
                    amount: 100,
                    asset_id: "1.3.5".into(),
                },
                receives: AssetAmount {
                    amount: 200,
                    asset_id: "1.3.9".into(),
                },
                is_maker: true,
            },
            block,
            id,
        )
    }

    #[test]
    fn test_queue_preserves_arrival_order() {
        let pipeline = FillPipeline::new();
        pipeline.push(vec![event("1.7.1", 1, "a"), event("1.7.2", 1, "b")]);
        pipeline.push(vec![event("1.7.3", 2, "c")]);

        let drained = pipeline.drain();
        let ids: Vec<&str> = drained.iter().map(|e| e.op.order_id.as_str()).collect();
        assert_eq!(ids, vec!["1.7.1", "1.7.2", "1.7.3"]);
        assert!(pipeline.is_queue_empty());
    }

    #[test]
    fn test_dedup_within_window() {
        let pipeline = FillPipeline::new();
        let key = event("1.7.1", 5, "x").dedup_key();
        let t0 = 1_000_000;

        assert!(pipeline.should_process(&key, t0));
        // Same key inside the window: exactly one accounting effect
        assert!(!pipeline.should_process(&key, t0 + 1));
        assert!(!pipeline.should_process(&key, t0 + FILL_DEDUPE_WINDOW_MS - 1));
        // Outside the window it may be processed again
        assert!(pipeline.should_process(&key, t0 + FILL_DEDUPE_WINDOW_MS + 1));
    }

    #[test]
    fn test_distinct_events_all_pass() {
        let pipeline = FillPipeline::new();
        let t0 = 1_000_000;
        // Same order, different blocks/event ids are distinct fills
        assert!(pipeline.should_process(&event("1.7.1", 5, "x").dedup_key(), t0));
        assert!(pipeline.should_process(&event("1.7.1", 6, "x").dedup_key(), t0));
        assert!(pipeline.should_process(&event("1.7.1", 6, "y").dedup_key(), t0));
    }

    #[test]
    fn test_eviction_trims_cache() {
        let pipeline = FillPipeline::new();
        let t0 = 1_000_000;
        pipeline.should_process("a:1:1", t0);
        pipeline.should_process("b:2:2", t0 + FILL_CLEANUP_INTERVAL_MS);
        pipeline.evict_expired(t0 + FILL_CLEANUP_INTERVAL_MS);
        assert_eq!(pipeline.recent_fills_tracked(), 1);
    }

    #[test]
    fn test_stale_cleaned_retention() {
        let pipeline = FillPipeline::new();
        let t0 = 1_000_000;
        pipeline.mark_stale_cleaned("1.7.42", t0);

        assert!(pipeline.is_stale_cleaned("1.7.42", t0 + 1));
        assert!(pipeline.is_stale_cleaned("1.7.42", t0 + stale_retention_ms() - 1));
        // Outside retention the order is just an orphan again
        assert!(!pipeline.is_stale_cleaned("1.7.42", t0 + stale_retention_ms() + 1));

        pipeline.prune_stale_cleaned(t0 + stale_retention_ms() + 1);
        assert!(!pipeline.is_stale_cleaned("1.7.42", t0 + 1));
    }

    #[test]
    fn test_dedup_cache_round_trips_persistence() {
        let pipeline = FillPipeline::new();
        pipeline.should_process("a:1:1", 500);
        let snapshot = pipeline.processed_fills_snapshot();

        let restored = FillPipeline::new();
        restored.restore_processed_fills(snapshot);
        // Restored entries still suppress duplicates
        assert!(!restored.should_process("a:1:1", 501));
    }
}
