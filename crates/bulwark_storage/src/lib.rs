//! BULWARK Storage
//!
//! Two-tier TTL cache: a bounded in-process map in front of a persistent
//! key/value store. Entries are immutable; a write replaces, never mutates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod entry;
pub mod persistent;
pub mod tier;

pub use cache::{CacheKey, CacheStats, TwoTierCache};
pub use entry::CacheEntry;
pub use persistent::{InMemoryStore, PersistentStore, RedbStore, StoreError};
pub use tier::MemoryTier;
