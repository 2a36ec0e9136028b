//! In-process cache tier.

use crate::entry::CacheEntry;
use indexmap::IndexMap;
use std::hash::Hash;
use std::sync::Arc;

/// Bounded in-process map
///
/// Keeps entries in write order; when full, the oldest write is evicted
/// first. Replacing a key moves it to the back.
#[derive(Debug, Clone)]
pub struct MemoryTier<K, V> {
    entries: IndexMap<K, Arc<CacheEntry<V>>>,
    max_entries: usize,
}

impl<K: Hash + Eq, V> MemoryTier<K, V> {
    /// Create a tier holding at most `max_entries` (at least one)
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up an entry regardless of expiry
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        self.entries.get(key).cloned()
    }

    /// Insert or replace; returns how many entries were evicted
    pub fn insert(&mut self, key: K, entry: Arc<CacheEntry<V>>) -> usize {
        self.entries.shift_remove(&key);
        self.entries.insert(key, entry);
        self.shrink()
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    /// Remove every entry matching `expired`; returns the count removed
    pub fn purge(&mut self, mut expired: impl FnMut(&CacheEntry<V>) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !expired(entry));
        before - self.entries.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Change the bound; returns how many entries were evicted
    pub fn set_max_entries(&mut self, max_entries: usize) -> usize {
        self.max_entries = max_entries.max(1);
        self.shrink()
    }

    /// Current bound
    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn shrink(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.max_entries {
            self.entries.shift_remove_index(0);
            evicted += 1;
        }
        evicted
    }
}
