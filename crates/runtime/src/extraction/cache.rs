//! TTL + LRU extraction result cache

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::ExtractionCacheConfig;

/// Cached extraction payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionEntry {
    pub text: String,
    pub file_name: String,
    pub file_type: String,
    pub tools_used: Vec<String>,
}

#[derive(Debug, Clone)]
struct CachedValue {
    entry: ExtractionEntry,
    inserted_at: DateTime<Utc>,
}

/// Cache statistics for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

/// Content-addressed extraction cache keyed by `(tenant_id, content_hash)`.
///
/// Capacity 100 entries; overflow evicts the oldest 20% by insertion order.
/// Entries expire after 24 h, removed by a 5-minute background sweep and
/// opportunistically on get/set.
pub struct DocumentExtractionCache {
    entries: DashMap<(String, String), CachedValue>,
    insertion_order: Mutex<VecDeque<(String, String)>>,
    counters: Mutex<Counters>,
    config: ExtractionCacheConfig,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expired: u64,
}

impl DocumentExtractionCache {
    pub fn new(config: ExtractionCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            insertion_order: Mutex::new(VecDeque::new()),
            counters: Mutex::new(Counters::default()),
            config,
        }
    }

    /// SHA-256 of the raw attachment bytes, hex-encoded.
    pub fn content_hash(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Look up an entry; an expired entry is deleted and reported as a miss.
    pub fn get(&self, tenant_id: &str, content_hash: &str) -> Option<ExtractionEntry> {
        self.sweep_expired();
        let key = (tenant_id.to_string(), content_hash.to_string());
        let found_expired = match self.entries.get(&key) {
            Some(value) if !self.is_expired(&value) => {
                self.counters.lock().hits += 1;
                return Some(value.entry.clone());
            }
            Some(_) => true,
            None => false,
        };
        // the read guard is released before any removal
        if found_expired {
            self.entries.remove(&key);
            self.insertion_order.lock().retain(|k| k != &key);
            let mut counters = self.counters.lock();
            counters.expired += 1;
            counters.misses += 1;
        } else {
            self.counters.lock().misses += 1;
        }
        None
    }

    /// Insert an entry, evicting the oldest 20% when over capacity.
    pub fn set(&self, tenant_id: &str, content_hash: &str, entry: ExtractionEntry) {
        self.sweep_expired();
        let key = (tenant_id.to_string(), content_hash.to_string());
        let fresh = self.entries
            .insert(
                key.clone(),
                CachedValue {
                    entry,
                    inserted_at: Utc::now(),
                },
            )
            .is_none();
        if fresh {
            self.insertion_order.lock().push_back(key);
        }
        if self.entries.len() > self.config.capacity {
            self.evict_oldest();
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.insertion_order.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.counters.lock();
        CacheStats {
            entries: self.entries.len(),
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            expired: counters.expired,
        }
    }

    fn is_expired(&self, value: &CachedValue) -> bool {
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        value.inserted_at + ttl < Utc::now()
    }

    /// Remove expired entries. Cheap when nothing has expired.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| self.is_expired(e.value()))
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        if count == 0 {
            return 0;
        }
        let mut order = self.insertion_order.lock();
        for key in &expired {
            self.entries.remove(key);
            order.retain(|k| k != key);
        }
        self.counters.lock().expired += count as u64;
        count
    }

    fn evict_oldest(&self) {
        let to_evict = ((self.config.capacity as f64 * self.config.eviction_fraction).ceil()
            as usize)
            .max(1);
        let mut order = self.insertion_order.lock();
        let mut evicted = 0u64;
        for _ in 0..to_evict {
            let Some(key) = order.pop_front() else { break };
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        drop(order);
        if evicted > 0 {
            tracing::debug!(evicted, "extraction cache evicted oldest entries");
            self.counters.lock().evictions += evicted;
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cache.sweep_expired();
            }
        })
    }
}
