//! Counters for dispatch and publish activity

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub received: AtomicU64,
    pub decode_failed: AtomicU64,
    pub validation_failed: AtomicU64,
    pub unknown_topic: AtomicU64,
    pub enqueued: AtomicU64,
    pub dropped_oldest: AtomicU64,
    pub dropped_new: AtomicU64,
    pub block_timeouts: AtomicU64,
    pub delivered: AtomicU64,
    pub handler_timeouts: AtomicU64,
    pub handler_errors: AtomicU64,
    pub revalidate_failed: AtomicU64,
    pub published: AtomicU64,
    pub duplicates: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            received: load(&self.received),
            decode_failed: load(&self.decode_failed),
            validation_failed: load(&self.validation_failed),
            unknown_topic: load(&self.unknown_topic),
            enqueued: load(&self.enqueued),
            dropped_oldest: load(&self.dropped_oldest),
            dropped_new: load(&self.dropped_new),
            block_timeouts: load(&self.block_timeouts),
            delivered: load(&self.delivered),
            handler_timeouts: load(&self.handler_timeouts),
            handler_errors: load(&self.handler_errors),
            revalidate_failed: load(&self.revalidate_failed),
            published: load(&self.published),
            duplicates: load(&self.duplicates),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub received: u64,
    pub decode_failed: u64,
    pub validation_failed: u64,
    pub unknown_topic: u64,
    pub enqueued: u64,
    pub dropped_oldest: u64,
    pub dropped_new: u64,
    pub block_timeouts: u64,
    pub delivered: u64,
    pub handler_timeouts: u64,
    pub handler_errors: u64,
    pub revalidate_failed: u64,
    pub published: u64,
    pub duplicates: u64,
}
