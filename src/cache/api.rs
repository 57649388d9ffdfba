//! Bounded TTL cache for upstream API responses.
//!
//! Entries expire after a fixed TTL and the cache holds at most
//! `max_entries` entries once [`ApiCache::enforce_capacity`] has run. Both
//! sweeps are plain O(n) scans; the capacity is small enough that an ordered
//! eviction structure is not worth carrying.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A serialized JSON payload and the instant it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: String,
    pub timestamp: Instant,
}

impl CacheEntry {
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    /// Stale once strictly older than `ttl`.
    pub fn is_stale_at(&self, now: Instant, ttl: Duration) -> bool {
        self.age_at(now) > ttl
    }
}

#[derive(Debug)]
pub struct ApiCache {
    entries: HashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl ApiCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry older than the TTL.
    pub fn clean_expired(&mut self) {
        self.clean_expired_at(Instant::now());
    }

    pub fn clean_expired_at(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale_at(now, ttl));
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!("Expired {} API cache entries", removed);
        }
    }

    /// Evicts the single oldest entry when over capacity.
    ///
    /// Ties on timestamp go to the smallest key so the choice does not depend
    /// on hash iteration order. Returns the evicted key, if any.
    pub fn enforce_capacity(&mut self) -> Option<String> {
        if self.entries.len() <= self.max_entries {
            return None;
        }

        let oldest = self
            .entries
            .iter()
            .min_by(|(ka, a), (kb, b)| a.timestamp.cmp(&b.timestamp).then_with(|| ka.cmp(kb)))
            .map(|(k, _)| k.clone())?;

        self.entries.remove(&oldest);
        tracing::debug!("API cache over capacity, evicted key={}", oldest);
        Some(oldest)
    }

    /// Raw lookup. Does not touch the timestamp and does not check staleness.
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Returns the payload only if the entry is younger than the TTL.
    pub fn get_fresh(&self, key: &str) -> Option<String> {
        self.get_fresh_at(key, Instant::now())
    }

    pub fn get_fresh_at(&self, key: &str, now: Instant) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| entry.age_at(now) < self.ttl)
            .map(|entry| entry.data.clone())
    }

    /// Stores `data` under `key`, replacing any previous entry.
    pub fn set(&mut self, key: String, data: String) {
        self.set_at(key, data, Instant::now());
    }

    pub fn set_at(&mut self, key: String, data: String, now: Instant) {
        let entry = CacheEntry {
            data,
            timestamp: now,
        };
        self.entries.insert(key, entry);
    }
}
