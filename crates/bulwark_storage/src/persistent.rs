//! Persistent cache tier.
//!
//! Tier 2 stores opaque encoded entries under string keys. Two backends
//! ship: [`InMemoryStore`] for tests and embedded use, and [`RedbStore`],
//! a single-file `redb` database.

use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("bulwark_cache");

/// Persistent store error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The storage engine failed
    #[error("Store backend error: {reason}")]
    Backend {
        /// Error message
        reason: String,
    },

    /// An entry could not be encoded
    #[error("Encode error: {reason}")]
    Encode {
        /// Error message
        reason: String,
    },

    /// A stored entry could not be decoded
    #[error("Decode error: {reason}")]
    Decode {
        /// Error message
        reason: String,
    },
}

impl StoreError {
    fn backend(err: impl Into<redb::Error>) -> Self {
        Self::Backend {
            reason: err.into().to_string(),
        }
    }
}

impl From<StoreError> for bulwark_core::CoordError {
    fn from(err: StoreError) -> Self {
        bulwark_core::CoordError::Storage {
            reason: err.to_string(),
        }
    }
}

/// Key/value store behind the in-process tier
pub trait PersistentStore: Send + Sync {
    /// Read raw bytes
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write raw bytes, replacing any previous value
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a key; returns whether it existed
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove every key
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written
    fn clear(&self) -> Result<(), StoreError>;

    /// Every key/value pair
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read
    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

/// Store kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistentStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Store backed by a `redb` database file
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or initialized
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(StoreError::backend)?;
        let txn = db.begin_write().map_err(StoreError::backend)?;
        txn.open_table(ENTRIES).map_err(StoreError::backend)?;
        txn.commit().map_err(StoreError::backend)?;
        tracing::debug!(path = %path.as_ref().display(), "opened persistent cache tier");
        Ok(Self { db })
    }
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl PersistentStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = txn.open_table(ENTRIES).map_err(StoreError::backend)?;
        let value = table.get(key).map_err(StoreError::backend)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(StoreError::backend)?;
            table.insert(key, value).map_err(StoreError::backend)?;
        }
        txn.commit().map_err(StoreError::backend)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        let existed = {
            let mut table = txn.open_table(ENTRIES).map_err(StoreError::backend)?;
            let removed = table.remove(key).map_err(StoreError::backend)?;
            removed.is_some()
        };
        txn.commit().map_err(StoreError::backend)?;
        Ok(existed)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(StoreError::backend)?;
        txn.delete_table(ENTRIES).map_err(StoreError::backend)?;
        txn.open_table(ENTRIES).map_err(StoreError::backend)?;
        txn.commit().map_err(StoreError::backend)
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let txn = self.db.begin_read().map_err(StoreError::backend)?;
        let table = txn.open_table(ENTRIES).map_err(StoreError::backend)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(StoreError::backend)? {
            let (k, v) = item.map_err(StoreError::backend)?;
            out.push((k.value().to_string(), v.value().to_vec()));
        }
        Ok(out)
    }
}
