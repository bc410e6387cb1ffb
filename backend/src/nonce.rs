// =============================================================================
// FIELDLINK — Anti-replay nonce cache
// =============================================================================
// Soft replay window, not a durable ledger: entries older than the TTL are
// logically expired and let a reused nonce through. Memory is capped; when the
// map grows past `max_entries` an insert sweeps expired entries and, if that is
// not enough, drops a bounded slice of the oldest ones.
// =============================================================================

use dashmap::{mapref::entry::Entry, DashMap};
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::clock::Clock;

pub trait NonceCache: Send + Sync {
    /// Check-and-record. True when `(device_id, nonce)` was already seen inside
    /// the TTL window; otherwise the pair is recorded at `now_ms`.
    fn seen_recently(&self, device_id: &str, nonce: &str, now_ms: i64) -> bool;
    /// Drops expired entries, returning how many were removed.
    fn purge_expired(&self, now_ms: i64) -> usize;
    fn len(&self) -> usize;
}

pub struct MemoryNonceCache {
    seen: DashMap<(String, String), i64>,
    ttl_ms: i64,
    max_entries: usize,
}

impl MemoryNonceCache {
    pub fn new(ttl_ms: i64, max_entries: usize) -> Self {
        Self { seen: DashMap::with_capacity(max_entries.min(100_000)), ttl_ms, max_entries: max_entries.max(1) }
    }

    fn evict(&self, now_ms: i64) {
        self.purge_expired(now_ms);
        let len = self.seen.len();
        if len <= self.max_entries {
            return;
        }
        // Over the ceiling with live entries: drop the overflow plus 10% headroom,
        // oldest first, so the next inserts don't immediately sweep again.
        let drop = len - self.max_entries + self.max_entries / 10;
        let mut aged: Vec<((String, String), i64)> =
            self.seen.iter().map(|e| (e.key().clone(), *e.value())).collect();
        aged.sort_unstable_by_key(|(_, ts)| *ts);
        for (k, _) in aged.into_iter().take(drop) {
            self.seen.remove(&k);
        }
    }
}

impl NonceCache for MemoryNonceCache {
    fn seen_recently(&self, device_id: &str, nonce: &str, now_ms: i64) -> bool {
        let replay = match self.seen.entry((device_id.to_string(), nonce.to_string())) {
            Entry::Occupied(mut e) if now_ms - *e.get() > self.ttl_ms => {
                e.insert(now_ms);
                false
            }
            Entry::Occupied(_) => true,
            Entry::Vacant(e) => {
                e.insert(now_ms);
                false
            }
        };
        // entry guard is dropped above; len()/retain() would deadlock on its shard
        if !replay && self.seen.len() > self.max_entries {
            self.evict(now_ms);
        }
        replay
    }

    fn purge_expired(&self, now_ms: i64) -> usize {
        let before = self.seen.len();
        self.seen.retain(|_, ts| now_ms - *ts <= self.ttl_ms);
        before.saturating_sub(self.seen.len())
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Periodic sweep so an idle cache doesn't hold expired nonces forever.
pub async fn eviction(cache: Arc<dyn NonceCache>, clock: Arc<dyn Clock>, every: Duration) {
    let mut iv = tokio::time::interval(every);
    loop {
        iv.tick().await;
        let evicted = cache.purge_expired(clock.now_ms());
        if evicted > 0 {
            info!(evicted, remaining = cache.len(), "nonce_eviction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_within_ttl() {
        let c = MemoryNonceCache::new(1_000, 100);
        assert!(!c.seen_recently("D1", "n1", 10_000));
        assert!(c.seen_recently("D1", "n1", 10_500));
        assert!(c.seen_recently("D1", "n1", 11_000));
    }

    #[test]
    fn test_same_nonce_other_device_is_fresh() {
        let c = MemoryNonceCache::new(1_000, 100);
        assert!(!c.seen_recently("D1", "n1", 10_000));
        assert!(!c.seen_recently("D2", "n1", 10_001));
    }

    #[test]
    fn test_expired_entry_does_not_block_reuse() {
        let c = MemoryNonceCache::new(1_000, 100);
        assert!(!c.seen_recently("D1", "n1", 10_000));
        assert!(!c.seen_recently("D1", "n1", 11_001));
        // the reuse re-armed the window
        assert!(c.seen_recently("D1", "n1", 11_500));
    }

    #[test]
    fn test_size_ceiling_holds() {
        let c = MemoryNonceCache::new(60_000, 50);
        for i in 0..500 {
            assert!(!c.seen_recently("D1", &format!("n{i}"), 1_000 + i));
        }
        assert!(c.len() <= 50, "cache grew to {}", c.len());
        // newest entries survive the oldest-first drop
        assert!(c.seen_recently("D1", "n499", 2_000));
    }

    #[test]
    fn test_purge_expired() {
        let c = MemoryNonceCache::new(1_000, 100);
        c.seen_recently("D1", "a", 0);
        c.seen_recently("D1", "b", 900);
        assert_eq!(c.purge_expired(1_500), 1);
        assert_eq!(c.len(), 1);
    }
}
