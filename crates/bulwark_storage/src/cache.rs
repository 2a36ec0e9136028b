//! Two-tier TTL cache.
//!
//! Reads try the in-process tier first, then the persistent tier; a valid
//! tier-2 hit is promoted. Expired entries are evicted from the tier they
//! were found in and reported as a miss. Writes go to both tiers. A failing
//! persistent tier is logged and bypassed, never surfaced to callers.

use crate::entry::CacheEntry;
use crate::persistent::{PersistentStore, StoreError};
use crate::tier::MemoryTier;
use bulwark_core::{CacheConfig, SharedClock, TelemetryEvent, TelemetrySink, emit_safely};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Namespaced cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    namespace: String,
    key: String,
}

impl CacheKey {
    /// Create a key in `namespace`
    #[must_use]
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Logical domain
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key within the namespace
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Unambiguous flat form used by the persistent tier
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.namespace.len(), self.namespace, self.key)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Hits served by the in-process tier
    pub tier1_hits: u64,
    /// Hits served by the persistent tier (and promoted)
    pub tier2_hits: u64,
    /// Lookups that found nothing valid
    pub misses: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    /// Entries dropped to respect the tier-1 bound
    pub evictions: u64,
    /// Writes
    pub writes: u64,
    /// Persistent tier failures
    pub tier2_errors: u64,
    /// Entries currently in tier 1
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit either tier
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.tier1_hits + self.tier2_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Two-tier cache of `V`
pub struct TwoTierCache<V> {
    memory: RwLock<MemoryTier<CacheKey, V>>,
    persistent: Option<Arc<dyn PersistentStore>>,
    default_ttl: RwLock<Duration>,
    clock: SharedClock,
    sink: Option<Arc<dyn TelemetrySink>>,
    stats: Mutex<CacheStats>,
}

impl<V> TwoTierCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a cache with only the in-process tier
    #[must_use]
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            memory: RwLock::new(MemoryTier::new(config.max_entries)),
            persistent: None,
            default_ttl: RwLock::new(config.default_ttl),
            clock,
            sink: None,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Attach a persistent tier
    #[must_use]
    pub fn with_persistent(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Report tier degradation to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Fresh value for `key`
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.get_entry(key).map(|entry| entry.value().clone())
    }

    /// Fresh entry for `key`, with its creation time and TTL
    #[must_use]
    pub fn get_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        let now = self.clock.now();

        let cached = self.memory.read().unwrap_or_else(PoisonError::into_inner).get(key);
        if let Some(entry) = cached {
            if entry.is_valid(now) {
                self.bump(|s| s.tier1_hits += 1);
                return Some(entry);
            }
            self.memory
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key);
            self.bump(|s| s.expirations += 1);
        }

        match self.read_persistent(key) {
            Some(entry) if entry.is_valid(now) => {
                let entry = Arc::new(entry);
                let evicted = self
                    .memory
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone(), Arc::clone(&entry));
                self.bump(|s| {
                    s.tier2_hits += 1;
                    s.evictions += evicted as u64;
                });
                tracing::debug!(%key, "promoted cache entry from persistent tier");
                Some(entry)
            }
            Some(_) => {
                self.remove_persistent(key);
                self.bump(|s| {
                    s.expirations += 1;
                    s.misses += 1;
                });
                None
            }
            None => {
                self.bump(|s| s.misses += 1);
                None
            }
        }
    }

    /// Store `value` under `key` in both tiers
    ///
    /// `ttl` falls back to the configured default.
    pub fn set(&self, key: CacheKey, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        let entry = Arc::new(CacheEntry::new(value, self.clock.now(), ttl));

        if let Some(store) = &self.persistent {
            let result = postcard::to_allocvec(entry.as_ref())
                .map_err(|e| StoreError::Encode {
                    reason: e.to_string(),
                })
                .and_then(|bytes| store.put(&key.storage_key(), &bytes));
            if let Err(err) = result {
                self.degraded("set", &err);
            }
        }

        let evicted = self
            .memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
        self.bump(|s| {
            s.writes += 1;
            s.evictions += evicted as u64;
        });
    }

    /// Remove `key` from both tiers; returns whether either tier held it
    pub fn delete(&self, key: &CacheKey) -> bool {
        let in_memory = self
            .memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let persisted = self.remove_persistent(key);
        in_memory || persisted
    }

    /// Remove everything from both tiers
    pub fn clear(&self) {
        self.memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(store) = &self.persistent {
            if let Err(err) = store.clear() {
                self.degraded("clear", &err);
            }
        }
    }

    /// Sweep expired entries from both tiers; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = self
            .memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .purge(|entry| !entry.is_valid(now));

        if let Some(store) = &self.persistent {
            match store.scan() {
                Ok(rows) => {
                    for (key, bytes) in rows {
                        let expired = match postcard::from_bytes::<CacheEntry<V>>(&bytes) {
                            Ok(entry) => !entry.is_valid(now),
                            Err(_) => true,
                        };
                        if expired {
                            match store.remove(&key) {
                                Ok(true) => removed += 1,
                                Ok(false) => {}
                                Err(err) => self.degraded("purge", &err),
                            }
                        }
                    }
                }
                Err(err) => self.degraded("purge", &err),
            }
        }

        self.bump(|s| s.expirations += removed as u64);
        removed
    }

    /// Change the tier-1 bound and default TTL
    pub fn reconfigure(&self, config: &CacheConfig) {
        *self
            .default_ttl
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config.default_ttl;
        let evicted = self
            .memory
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_max_entries(config.max_entries);
        self.bump(|s| s.evictions += evicted as u64);
    }

    /// TTL applied when none is given
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        *self.default_ttl.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone();
        stats.entries = self.memory.read().unwrap_or_else(PoisonError::into_inner).len();
        stats
    }

    /// Zero the counters
    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = CacheStats::default();
    }

    fn read_persistent(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let store = self.persistent.as_ref()?;
        match store.get(&key.storage_key()) {
            Ok(Some(bytes)) => match postcard::from_bytes::<CacheEntry<V>>(&bytes) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    self.degraded(
                        "decode",
                        &StoreError::Decode {
                            reason: e.to_string(),
                        },
                    );
                    self.remove_persistent(key);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.degraded("get", &err);
                None
            }
        }
    }

    fn remove_persistent(&self, key: &CacheKey) -> bool {
        let Some(store) = &self.persistent else {
            return false;
        };
        match store.remove(&key.storage_key()) {
            Ok(existed) => existed,
            Err(err) => {
                self.degraded("delete", &err);
                false
            }
        }
    }

    fn degraded(&self, operation: &str, err: &StoreError) {
        tracing::warn!(%operation, error = %err, "persistent cache tier failed; continuing with memory tier");
        self.bump(|s| s.tier2_errors += 1);
        if let Some(sink) = &self.sink {
            emit_safely(
                sink.as_ref(),
                &TelemetryEvent::CacheTierDegraded {
                    operation: operation.to_string(),
                    reason: err.to_string(),
                },
            );
        }
    }

    fn bump(&self, f: impl FnOnce(&mut CacheStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
