use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Reject;

/// Process-wide counters for every accept and drop path.
#[derive(Default)]
pub struct Metrics {
    pub accepted: AtomicU64,
    pub duplicates: AtomicU64,
    pub file_fallback: AtomicU64,
    pub auth_reject: AtomicU64,
    pub malformed: AtomicU64,
    pub insert_failed: AtomicU64,
    pub db_unavailable: AtomicU64,
    pub batch_skipped: AtomicU64,
    pub auto_registered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_reject(&self, r: &Reject) {
        let c = match r {
            Reject::BadBody(_) => &self.malformed,
            Reject::DbUnavailable => &self.db_unavailable,
            Reject::TelemetryInsertFailed { .. } | Reject::FallbackWriteFailed => &self.insert_failed,
            _ => &self.auth_reject,
        };
        Self::add(c, 1);
    }

    pub fn snapshot(&self, nonce_cache_size: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            file_fallback: self.file_fallback.load(Ordering::Relaxed),
            auth_reject: self.auth_reject.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            insert_failed: self.insert_failed.load(Ordering::Relaxed),
            db_unavailable: self.db_unavailable.load(Ordering::Relaxed),
            batch_skipped: self.batch_skipped.load(Ordering::Relaxed),
            auto_registered: self.auto_registered.load(Ordering::Relaxed),
            nonce_cache_size,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    // accept paths
    pub accepted: u64,
    pub duplicates: u64,
    pub file_fallback: u64,
    // drop paths
    pub auth_reject: u64,
    pub malformed: u64,
    pub insert_failed: u64,
    pub db_unavailable: u64,
    pub batch_skipped: u64,
    // registry
    pub auto_registered: u64,
    // state sizes
    pub nonce_cache_size: usize,
}
