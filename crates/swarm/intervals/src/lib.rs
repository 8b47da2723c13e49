//! Interval sets recording which index ranges of a stream are complete,
//! and their persistence in a [`StateStore`].

mod intervals;

pub use intervals::Intervals;

use vertex_storage::{DatabaseError, StateStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    #[error("truncated interval encoding")]
    Truncated,

    #[error("non-canonical interval [{start}, {end}]")]
    NotCanonical { start: u64, end: u64 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Loads and saves [`Intervals`] under string keys.
#[derive(Debug, Clone)]
pub struct IntervalStore<S> {
    store: S,
}

impl<S: StateStore> IntervalStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the stored set, or an empty one if the key is absent.
    pub fn get(&self, key: &str) -> Result<Intervals, IntervalError> {
        match self.store.get(key)? {
            Some(bytes) => Intervals::decode(&bytes),
            None => Ok(Intervals::new()),
        }
    }

    pub fn put(&self, key: &str, intervals: &Intervals) -> Result<(), IntervalError> {
        Ok(self.store.put(key, &intervals.encode())?)
    }

    /// Adds `[start, end]` to the set under `key` and persists it.
    pub fn add(&self, key: &str, start: u64, end: u64) -> Result<Intervals, IntervalError> {
        let mut intervals = self.get(key)?;
        intervals.add(start, end);
        self.put(key, &intervals)?;
        Ok(intervals)
    }

    pub fn delete(&self, key: &str) -> Result<(), IntervalError> {
        Ok(self.store.delete(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use vertex_storage::MemoryStateStore;

    #[test]
    fn test_store_roundtrip() {
        let store = IntervalStore::new(MemoryStateStore::new());
        assert!(store.get("p|SYNC|1").unwrap().is_empty());

        store.add("p|SYNC|1", 1, 5).unwrap();
        let merged = store.add("p|SYNC|1", 6, 9).unwrap();
        assert_eq!(merged.ranges(), &[(1, 9)]);
        assert_eq!(store.get("p|SYNC|1").unwrap(), merged);
        assert!(store.get("p|SYNC|2").unwrap().is_empty());

        store.delete("p|SYNC|1").unwrap();
        assert!(store.get("p|SYNC|1").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_value() {
        let backend = MemoryStateStore::new();
        backend.put("k", &[1, 2]).unwrap();
        let store = IntervalStore::new(&backend);
        assert_matches!(store.get("k"), Err(IntervalError::Truncated));
    }
}
