//! redb-backed [`StateStore`].

use std::path::Path;

use metrics::Counter;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;
use vertex_storage::{DatabaseError, StateStore};

/// Key: UTF-8 state key. Value: caller-encoded bytes.
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");

#[derive(Clone, Debug)]
struct StoreMetrics {
    reads: Counter,
    writes: Counter,
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self {
            reads: metrics::counter!("storage.redb.reads_total"),
            writes: metrics::counter!("storage.redb.writes_total"),
        }
    }
}

/// Persistent state store. Safe for concurrent use.
pub struct RedbStateStore {
    db: Database,
    metrics: StoreMetrics,
}

impl RedbStateStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;

        let write_txn = db.begin_write().map_err(db_err)?;
        {
            let _ = write_txn.open_table(STATE_TABLE).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;

        debug!(path = %path.as_ref().display(), "Opened redb state store");
        Ok(Self {
            db,
            metrics: StoreMetrics::default(),
        })
    }
}

fn db_err(err: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::Other(err.to_string())
}

impl StateStore for RedbStateStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.metrics.reads.increment(1);
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(STATE_TABLE).map_err(db_err)?;
        Ok(table.get(key).map_err(db_err)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), DatabaseError> {
        self.metrics.writes.increment(1);
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(STATE_TABLE).map_err(db_err)?;
            table.insert(key, value).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)
    }

    fn delete(&self, key: &str) -> Result<(), DatabaseError> {
        self.metrics.writes.increment(1);
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(STATE_TABLE).map_err(db_err)?;
            table.remove(key).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, DatabaseError> {
        self.metrics.reads.increment(1);
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(STATE_TABLE).map_err(db_err)?;

        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(db_err)? {
            let (key, _) = entry.map_err(db_err)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_owned());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let store = RedbStateStore::open(dir.path().join("state.redb")).unwrap();

        assert_eq!(store.get("missing").unwrap(), None);
        store.put("k", b"value").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"value".to_vec()));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = RedbStateStore::open(&path).unwrap();
            store.put("peer|SYNC|3", &[1, 2, 3]).unwrap();
        }
        let store = RedbStateStore::open(&path).unwrap();
        assert_eq!(store.get("peer|SYNC|3").unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_prefix_scan() {
        let dir = tempdir().unwrap();
        let store = RedbStateStore::open(dir.path().join("state.redb")).unwrap();
        for key in ["a|SYNC|1", "a|SYNC|2", "ab|SYNC|1", "b|SYNC|1"] {
            store.put(key, b"x").unwrap();
        }
        assert_eq!(
            store.keys_with_prefix("a|").unwrap(),
            vec!["a|SYNC|1".to_string(), "a|SYNC|2".to_string()]
        );
    }
}
