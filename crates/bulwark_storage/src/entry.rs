//! Cache entries.

use bulwark_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable cached value with its lifetime
///
/// Valid while `now - created_at <= ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    value: V,
    created_at: Timestamp,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Create an entry
    #[must_use]
    pub fn new(value: V, created_at: Timestamp, ttl: Duration) -> Self {
        Self {
            value,
            created_at,
            ttl,
        }
    }

    /// Cached value
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Creation instant
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Time to live
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Last instant at which the entry is still valid
    #[must_use]
    pub fn expires_at(&self) -> Timestamp {
        self.created_at.saturating_add(self.ttl)
    }

    /// Age at `now`
    #[must_use]
    pub fn age(&self, now: Timestamp) -> Duration {
        now.duration_since(self.created_at)
    }

    /// Whether the entry is still valid at `now`
    #[must_use]
    pub fn is_valid(&self, now: Timestamp) -> bool {
        self.age(now) <= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_boundary() {
        let entry = CacheEntry::new("v", Timestamp::from_millis(1_000), Duration::from_millis(500));
        assert!(entry.is_valid(Timestamp::from_millis(1_000)));
        assert!(entry.is_valid(Timestamp::from_millis(1_500)));
        assert!(!entry.is_valid(Timestamp::from_millis(1_501)));
        assert_eq!(entry.expires_at(), Timestamp::from_millis(1_500));
    }

    #[test]
    fn test_age_never_negative() {
        let entry = CacheEntry::new(1u8, Timestamp::from_millis(10), Duration::ZERO);
        assert_eq!(entry.age(Timestamp::from_millis(5)), Duration::ZERO);
        assert!(entry.is_valid(Timestamp::from_millis(10)));
    }

    #[test]
    fn test_postcard_encoding() {
        let entry = CacheEntry::new(
            "hello".to_string(),
            Timestamp::from_millis(42),
            Duration::from_secs(3),
        );
        let bytes = postcard::to_allocvec(&entry).unwrap();
        let back: CacheEntry<String> = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, entry);
    }
}
