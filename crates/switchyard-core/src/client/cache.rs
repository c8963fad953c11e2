//! ResultCache - TTL 付き結果キャッシュ
//!
//! Entries older than the TTL are treated as absent and removed on access.
//! When full, the oldest *inserted* entry is evicted (insertion order, not
//! recency; overwriting a key counts as a fresh insertion).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::Fingerprint;
use crate::config::CacheConfig;
use crate::ports::Clock;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Insertion order, oldest first.
    order: VecDeque<Fingerprint>,
}

impl CacheInner {
    fn remove(&mut self, key: &Fingerprint) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entries: usize,
}

pub struct ResultCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl: config.ttl(),
            capacity: config.capacity.max(1),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        (now - entry.stored_at)
            .to_std()
            .is_ok_and(|age| age > self.ttl)
    }

    /// Lookup that counts towards the hit rate.
    pub fn get(&self, key: &Fingerprint) -> Option<serde_json::Value> {
        let value = self.peek(key);
        let counter = if value.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Lookup that leaves the statistics alone.
    pub fn peek(&self, key: &Fingerprint) -> Option<serde_json::Value> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let entry = inner.entries.get(key)?;
        if self.is_expired(entry, now) {
            inner.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: Fingerprint, value: serde_json::Value) {
        let stored_at = self.clock.now();
        let mut inner = self.inner.lock();
        inner.remove(&key);
        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, CacheEntry { value, stored_at });
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let expired: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hits over lookups; 0.0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            entries: self.len(),
        }
    }
}
