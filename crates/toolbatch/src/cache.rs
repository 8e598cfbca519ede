//! Whole-batch result caching.
//!
//! Responses are keyed by a SHA-256 digest of the batch content (actions,
//! metadata and user), so identical batches collide regardless of the
//! trajectory or trace IDs the caller picked. Expired entries are dropped
//! lazily on lookup and when `store` pushes the map over capacity.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::batch::{BatchResponse, Metadata};
use crate::config::CacheConfig;

#[derive(Debug, Clone)]
struct CacheEntry {
    response: BatchResponse,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Counters for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    pub max_size: usize,
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
}

/// Content-addressed, TTL- and capacity-bounded response cache.
#[derive(Debug)]
pub struct BatchCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BatchCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up a live entry. An expired entry is removed and reported as a
    /// miss.
    pub fn lookup(&self, key: &str) -> Option<BatchResponse> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let hit = match entries.get(key).map(|entry| entry.is_expired(now)) {
            Some(false) => entries.get(key).map(|entry| entry.response.clone()),
            Some(true) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        drop(entries);

        let counter = if hit.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Store a response with the configured TTL. No-op when disabled.
    ///
    /// When the map is over capacity, expired entries go first; if that is
    /// not enough, entries are removed in ascending key order until the map
    /// is `evict_slack` below capacity.
    pub fn store(&self, key: String, response: BatchResponse) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if entries.len() > self.config.max_entries {
            entries.retain(|_, entry| !entry.is_expired(now));
        }
        if entries.len() > self.config.max_entries {
            let excess = entries.len() - self.config.max_entries + self.config.evict_slack;
            let mut keys: Vec<String> = entries.keys().cloned().collect();
            keys.sort_unstable();
            for k in keys.into_iter().take(excess) {
                entries.remove(&k);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                response,
                expires_at: now + self.config.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total_entries: entries.len(),
            active_entries: entries.len() - expired,
            expired_entries: expired,
            max_size: self.config.max_entries,
            enabled: self.config.enabled,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Cache key for a batch: hex SHA-256 of the key-sorted JSON of its
/// actions, metadata and user.
pub fn cache_key(actions: &[String], extra_fields: &[Metadata], user_id: Option<&str>) -> String {
    // serde_json maps are ordered, so the serialization is key-sorted.
    let normalized = json!({
        "actions": actions,
        "extra_fields": extra_fields,
        "user_id": user_id,
    });
    let mut hasher = Sha256::new();
    hasher.update(normalized.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
