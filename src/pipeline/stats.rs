//! Pipeline counters shared across the ingest, drain and reconcile tasks.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Lock-free counters. Each field has exactly one writer task.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    malformed: AtomicU64,
    enqueued: AtomicU64,
    overflow_drops: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    config_sent: AtomicU64,
    fixes_routed: AtomicU64,
    emitted: AtomicU64,
    queue_len: AtomicUsize,
    advertised_interval_secs: AtomicU32,
}

/// Point-in-time copy for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub enqueued: u64,
    pub overflow_drops: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub config_sent: u64,
    pub fixes_routed: u64,
    pub emitted: u64,
    pub queue_len: usize,
    pub advertised_interval_secs: u32,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) -> u64 {
            self.$field.fetch_add(1, Ordering::Relaxed) + 1
        }
    };
}

impl PipelineStats {
    pub fn new(baseline_interval_secs: u32) -> Self {
        let stats = Self::default();
        stats
            .advertised_interval_secs
            .store(baseline_interval_secs, Ordering::Relaxed);
        stats
    }

    counter!(record_received, received);
    counter!(record_malformed, malformed);
    counter!(record_enqueued, enqueued);
    counter!(record_overflow_drop, overflow_drops);
    counter!(record_persisted, persisted);
    counter!(record_persist_failure, persist_failures);
    counter!(record_config_sent, config_sent);
    counter!(record_fix_routed, fixes_routed);
    counter!(record_emitted, emitted);

    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    pub fn set_advertised_interval(&self, secs: u32) {
        self.advertised_interval_secs.store(secs, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            config_sent: self.config_sent.load(Ordering::Relaxed),
            fixes_routed: self.fixes_routed.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            queue_len: self.queue_len.load(Ordering::Relaxed),
            advertised_interval_secs: self.advertised_interval_secs.load(Ordering::Relaxed),
        }
    }
}
