//! Shared dispatch counters, read by the debug endpoint.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug)]
pub struct DispatchStats {
    started_at: DateTime<Utc>,
    updates_received: AtomicU64,
    enqueue_failures: AtomicU64,
    handler_failures: AtomicU64,
    active_conversations: AtomicUsize,
}

impl Default for DispatchStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            updates_received: AtomicU64::new(0),
            enqueue_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            active_conversations: AtomicUsize::new(0),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }

    pub fn record_update(&self) {
        self.updates_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue_failure(&self) {
        self.enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_conversations(&self, n: usize) {
        self.active_conversations.store(n, Ordering::Relaxed);
    }

    pub fn updates_received(&self) -> u64 {
        self.updates_received.load(Ordering::Relaxed)
    }

    pub fn enqueue_failures(&self) -> u64 {
        self.enqueue_failures.load(Ordering::Relaxed)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub fn active_conversations(&self) -> usize {
        self.active_conversations.load(Ordering::Relaxed)
    }
}
