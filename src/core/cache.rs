// src/core/cache.rs

//! The bounded, TTL-based response cache for read paths.
//!
//! Entries are keyed by `"{selection_key}|{cache_key}"`, scoping every cached
//! value to the cluster selection that produced it. The overflow policy is
//! intentionally the simplest correct one: when the entry budget is exceeded
//! the whole cache is flushed.

use crate::core::metrics;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// TTL + max-entries cache shared by all fetch paths.
#[derive(Debug)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    fn composite_key(selection_key: &str, cache_key: &str) -> String {
        format!("{selection_key}|{cache_key}")
    }

    /// Returns the cached value unless it is missing or expired. Expired
    /// entries are never returned.
    pub fn get(&self, selection_key: &str, cache_key: &str) -> Option<serde_json::Value> {
        let key = Self::composite_key(selection_key, cache_key);
        let expired = {
            let entries = self.entries.read();
            match entries.get(&key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    metrics::RESPONSE_CACHE_LOOKUPS_TOTAL
                        .with_label_values(&["hit"])
                        .inc();
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.entries.write().remove(&key);
        }
        metrics::RESPONSE_CACHE_LOOKUPS_TOTAL
            .with_label_values(&["miss"])
            .inc();
        None
    }

    /// Stores a value under the composite key. On overflow the cache is fully
    /// flushed before inserting.
    pub fn put(&self, selection_key: &str, cache_key: &str, value: serde_json::Value) {
        let key = Self::composite_key(selection_key, cache_key);
        let mut entries = self.entries.write();
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            debug!(
                "Response cache exceeded {} entries; flushing.",
                self.max_entries
            );
            entries.clear();
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drops every entry belonging to one selection key. Used when a cluster
    /// leaves the selection.
    pub fn invalidate_selection(&self, selection_key: &str) {
        let prefix = format!("{selection_key}|");
        self.entries
            .write()
            .retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn flush(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
