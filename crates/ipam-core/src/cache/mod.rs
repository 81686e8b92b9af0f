//! TTL cache for collection and object reads
//!
//! Entries are keyed by resource type plus normalized (sorted) filter
//! parameters and tagged with their resource type. Writes invalidate every
//! entry of the written type.
//!
//! ## Storage
//!
//! Entries live in a bounded `moka` cache with per-entry expiry, so each
//! resource type keeps its own TTL.
//!
//! ## Concurrency
//!
//! Each resource type carries a generation counter that invalidation bumps.
//! A read-through snapshots the generation before fetching and only stores
//! the fetched value if the generation is unchanged, so a fetch that raced a
//! write can never repopulate the cache with pre-write data. The generation
//! check and the store happen under one mutex that invalidation also takes;
//! it is never held across an `.await`.

use moka::notification::RemovalCause;
use moka::sync::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::traits::Filters;

/// One cached read
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Deterministic key (see [`list_key`] / [`object_key`])
    pub key: String,
    /// Cached response
    pub value: Value,
    /// Resource type tag ("dcim.sites")
    pub resource_type: String,
    /// Hard expiry
    pub expires_at: Instant,
}

/// Expires each entry at its own `expires_at`
struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads served from cache
    pub hits: u64,
    /// Reads that went to the backend
    pub misses: u64,
    /// Entries removed by invalidation
    pub invalidations: u64,
    /// Entries removed on expiry or to respect `max_entries`
    pub evictions: u64,
    /// Live entries
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: Arc<AtomicU64>,
}

/// Key for a list call: `resource_type?k1=v1&k2=v2` with keys sorted
pub fn list_key(resource_type: &str, filters: &Filters) -> String {
    let query: Vec<String> = filters.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", resource_type, query.join("&"))
}

/// Key for a get-by-id call: `resource_type/id`
pub fn object_key(resource_type: &str, id: u64) -> String {
    format!("{}/{}", resource_type, id)
}

/// Shared TTL cache
///
/// Constructed once per client and shared by reference; there is no global
/// instance.
pub struct ResponseCache {
    config: CacheConfig,
    entries: Cache<String, CacheEntry>,
    generations: Mutex<HashMap<String, u64>>,
    counters: Counters,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("enabled", &self.config.enabled)
            .field("max_entries", &self.config.max_entries)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl ResponseCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        let counters = Counters::default();
        let evictions = Arc::clone(&counters.evictions);
        let entries = Cache::builder()
            .max_capacity(config.max_entries as u64)
            .expire_after(EntryExpiry)
            .eviction_listener(move |_key, _value, cause: RemovalCause| {
                if cause.was_evicted() {
                    evictions.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            config,
            entries,
            generations: Mutex::new(HashMap::new()),
            counters,
        }
    }

    /// Whether the cache stores anything at all
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// TTL that applies to a resource type
    pub fn ttl_for(&self, resource_type: &str) -> Duration {
        self.config.ttl_for(resource_type)
    }

    fn generations(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        // A poisoned lock only means another caller panicked mid-update;
        // the counters themselves are still valid.
        self.generations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a live entry, counting a hit or a miss
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        match self.entries.get(key) {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Current generation of a resource type
    pub fn generation(&self, resource_type: &str) -> u64 {
        self.generations().get(resource_type).copied().unwrap_or(0)
    }

    /// Store a value unless the resource type was invalidated since `generation`
    ///
    /// # Returns
    ///
    /// `true` if the value was stored.
    pub fn insert_if_current(
        &self,
        key: &str,
        resource_type: &str,
        value: Value,
        generation: u64,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        let ttl = self.config.ttl_for(resource_type);
        let generations = self.generations();
        if generations.get(resource_type).copied().unwrap_or(0) != generation {
            trace!("Discarding stale read for {} (generation moved)", key);
            return false;
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                resource_type: resource_type.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        drop(generations);
        true
    }

    /// Serve from cache, or run `fetch` and populate on success
    ///
    /// Errors are never cached.
    pub async fn read_through<F>(&self, key: &str, resource_type: &str, fetch: F) -> Result<Value>
    where
        F: Future<Output = Result<Value>>,
    {
        if let Some(value) = self.get(key) {
            debug!("Cache hit: {}", key);
            return Ok(value);
        }
        debug!("Cache miss: {}", key);

        let generation = self.generation(resource_type);
        let value = fetch.await?;
        self.insert_if_current(key, resource_type, value.clone(), generation);
        Ok(value)
    }

    /// Remove matching entries; the caller holds the generation lock
    ///
    /// Returns the resource types of the removed entries, one per entry.
    fn remove_where(&self, pred: impl Fn(&CacheEntry) -> bool) -> Vec<String> {
        let doomed: Vec<(Arc<String>, String)> = self
            .entries
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(key, entry)| (key, entry.resource_type))
            .collect();
        for (key, _) in &doomed {
            self.entries.invalidate(key.as_str());
        }
        self.counters
            .invalidations
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        doomed.into_iter().map(|(_, resource_type)| resource_type).collect()
    }

    /// Drop every entry tagged with `resource_type`
    ///
    /// Always bumps the generation, even when nothing was cached, so in-flight
    /// reads of that type are discarded.
    pub fn invalidate_type(&self, resource_type: &str) -> usize {
        let mut generations = self.generations();
        *generations.entry(resource_type.to_string()).or_insert(0) += 1;
        let removed = self.remove_where(|e| e.resource_type == resource_type).len();
        debug!("Invalidated {} cache entries for {}", removed, resource_type);
        removed
    }

    /// Drop every entry whose key contains `pattern`
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut generations = self.generations();
        let types = self.remove_where(|e| e.key.contains(pattern));
        let touched: BTreeSet<&String> = types.iter().collect();
        for resource_type in touched {
            *generations.entry(resource_type.clone()).or_insert(0) += 1;
        }
        debug!("Invalidated {} cache entries matching '{}'", types.len(), pattern);
        types.len()
    }

    /// Drop everything
    ///
    /// Every resource type seen so far moves to a new generation exactly once.
    pub fn clear(&self) {
        let mut generations = self.generations();
        let mut touched: BTreeSet<String> = self.remove_where(|_| true).into_iter().collect();
        touched.extend(generations.keys().cloned());
        for resource_type in touched {
            *generations.entry(resource_type).or_insert(0) += 1;
        }
    }

    /// Remove expired entries eagerly
    pub fn purge_expired(&self) -> usize {
        let before = self.counters.evictions.load(Ordering::Relaxed);
        self.entries.run_pending_tasks();
        (self.counters.evictions.load(Ordering::Relaxed) - before) as usize
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: self.entries.entry_count() as usize,
        }
    }
}
