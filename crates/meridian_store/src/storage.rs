//! Storage primitives owned by one partition.
//!
//! `Storage` is the thread-safe key/value interface the worker pool commits
//! through; the lock manager guarantees concurrent workers touch disjoint
//! write sets. `LookupMasterIndex` is the per-partition mastership map read
//! by the forwarder and updated only by committed remasters.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::{Key, Metadata, Record};

/// Key/value engine interface for a partition's records.
pub trait Storage: Send + Sync + 'static {
    fn read(&self, key: &Key) -> Option<Record>;
    fn write(&self, key: Key, record: Record);
    fn delete(&self, key: &Key);
}

/// In-memory storage engine.
#[derive(Default)]
pub struct MemStorage {
    inner: RwLock<HashMap<Key, Record>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &Key) -> Option<Record> {
        self.inner.read().unwrap().get(key).cloned()
    }

    fn write(&self, key: Key, record: Record) {
        self.inner.write().unwrap().insert(key, record);
    }

    fn delete(&self, key: &Key) {
        self.inner.write().unwrap().remove(key);
    }
}

/// Mastership metadata for keys residing in the local partition.
///
/// A missing key means the partition is authoritative but has no record yet;
/// callers treat that as `{master: 0, counter: 0}`.
#[derive(Default)]
pub struct LookupMasterIndex {
    inner: RwLock<HashMap<Key, Metadata>>,
}

impl LookupMasterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<Metadata> {
        self.inner.read().unwrap().get(key).copied()
    }

    /// Metadata for `key`, defaulting new keys to `{0, 0}`.
    pub fn get_or_default(&self, key: &Key) -> Metadata {
        self.get(key).unwrap_or_default()
    }

    /// Invoked only by a committed remaster (and by initial data seeding).
    pub fn update(&self, key: Key, metadata: Metadata) {
        self.inner.write().unwrap().insert(key, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_delete_round_trip() {
        let storage = MemStorage::new();
        let key = "alpha".to_string();
        assert!(storage.read(&key).is_none());

        storage.write(
            key.clone(),
            Record {
                value: "1".into(),
                metadata: Metadata { master: 2, counter: 1 },
            },
        );
        let record = storage.read(&key).unwrap();
        assert_eq!(record.value, "1");
        assert_eq!(record.metadata.master, 2);

        storage.delete(&key);
        assert!(storage.read(&key).is_none());
    }

    #[test]
    fn missing_index_entries_default_to_zero() {
        let index = LookupMasterIndex::new();
        let key = "fresh".to_string();
        assert!(index.get(&key).is_none());
        assert_eq!(index.get_or_default(&key), Metadata::default());

        index.update(key.clone(), Metadata { master: 1, counter: 4 });
        assert_eq!(index.get_or_default(&key).counter, 4);
    }
}
