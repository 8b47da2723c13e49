//! Small key/value state store used for protocol bookkeeping.
//!
//! Backends implement [`StateStore`]; values are opaque bytes and each caller
//! owns its own encoding. [`MemoryStateStore`] lives here, the persistent
//! backend is in `vertex-storage-redb`.

use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Database error type.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    /// Failed to decode a stored value.
    #[error("failed to decode value for key {key}: {reason}")]
    Decode { key: String, reason: String },
    /// Backend failure.
    #[error("{_0}")]
    Other(String),
}

/// String-keyed byte store.
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError>;

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DatabaseError>;

    fn delete(&self, key: &str) -> Result<(), DatabaseError>;

    /// All keys starting with `prefix`, in ascending order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, DatabaseError>;
}

/// Volatile [`StateStore`].
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DatabaseError> {
        self.entries.write().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, DatabaseError> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStateStore::new();
        assert_eq!(store.get("a").unwrap(), None);

        store.put("a", b"one").unwrap();
        store.put("a", b"two").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);

        store.delete("a").unwrap();
        assert!(store.is_empty());
        // deleting a missing key is not an error
        store.delete("a").unwrap();
    }

    #[test]
    fn test_prefix_scan() {
        let store = MemoryStateStore::new();
        for key in ["peer1|SYNC|1", "peer1|SYNC|2", "peer2|SYNC|1", "peer10|SYNC|0"] {
            store.put(key, b"x").unwrap();
        }
        assert_eq!(
            store.keys_with_prefix("peer1|").unwrap(),
            vec!["peer1|SYNC|1".to_string(), "peer1|SYNC|2".to_string()]
        );
    }

    #[test]
    fn test_through_arc() {
        fn write(store: impl StateStore) {
            store.put("k", b"v").unwrap();
        }
        let store = Arc::new(MemoryStateStore::new());
        write(store.clone());
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
    }
}
