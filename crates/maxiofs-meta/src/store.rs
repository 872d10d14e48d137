//! The transactional KV store.
//!
//! A thin layer over [`redb`]: one table, string keys, JSON-encoded values.
//! Reads go through snapshot read transactions. All writes go through
//! [`MetaStore::update`], which runs a closure against an exclusive write
//! transaction and commits only if the closure succeeds; a closure error
//! aborts the transaction, leaving the store untouched.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use maxiofs_core::{Error, Result};

/// The single table holding every record family.
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Wrap any storage-layer error as an internal domain error.
fn internal<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::Internal(anyhow::Error::new(err))
}

/// Decode a JSON record, surfacing corruption as an internal error.
fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt record at {key}: {e}")))
}

// ---------------------------------------------------------------------------
// MetaStore
// ---------------------------------------------------------------------------

/// Durable, transactional metadata store.
///
/// Thread-safe; share behind an `Arc`. redb serializes write transactions,
/// so concurrent [`MetaStore::update`] calls never interleave.
pub struct MetaStore {
    db: Database,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").finish_non_exhaustive()
    }
}

impl MetaStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the database cannot be opened or the
    /// table cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(internal)?;
        }
        let db = Database::create(path).map_err(internal)?;

        // Make sure the table exists so first reads do not fail.
        let txn = db.begin_write().map_err(internal)?;
        txn.open_table(META).map_err(internal)?;
        txn.commit().map_err(internal)?;

        debug!(path = %path.display(), "opened metadata store");
        Ok(Self { db })
    }

    /// Read the raw bytes at `key`.
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(internal)?;
        let table = txn.open_table(META).map_err(internal)?;
        Ok(table
            .get(key)
            .map_err(internal)?
            .map(|guard| guard.value().to_vec()))
    }

    /// Read and decode the record at `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a single record in its own transaction.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.update(|txn| txn.put(key, value))
    }

    /// Delete a single record in its own transaction. Idempotent.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.update(|txn| txn.delete(key))
    }

    /// Scan up to `limit` rows under `prefix`, strictly after `start_after`
    /// when given, in ascending key order.
    pub fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(internal)?;
        let table = txn.open_table(META).map_err(internal)?;
        scan_table(&table, prefix, start_after, limit)
    }

    /// Decode every row under `prefix` as `T`, in ascending key order.
    pub fn scan_values<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let rows = self.scan_prefix(prefix, None, usize::MAX)?;
        rows.iter()
            .map(|(key, bytes)| decode(key, bytes))
            .collect()
    }

    /// Run `f` inside an exclusive write transaction.
    ///
    /// The transaction commits iff `f` returns `Ok`; any error aborts it and
    /// the store is left unchanged. Logical conflicts detected inside `f`
    /// (for example a compare-and-swap mismatch) should be returned as
    /// [`Error::Conflict`] so callers can retry.
    pub fn update<R>(&self, f: impl FnOnce(&mut MetaTxn<'_>) -> Result<R>) -> Result<R> {
        let txn = self.db.begin_write().map_err(internal)?;
        let result = {
            let table = txn.open_table(META).map_err(internal)?;
            let mut meta_txn = MetaTxn { table };
            f(&mut meta_txn)
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(internal)?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the write transaction aborts it.
                drop(txn);
                Err(err)
            }
        }
    }

    /// Atomically replace the record at `key` iff its current raw bytes
    /// equal `expected` (`None` = the key must be absent). `new = None`
    /// deletes the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when the current value differs from
    /// `expected`.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<()> {
        self.update(|txn| {
            let current = txn.get_raw(key)?;
            if current.as_deref() != expected {
                return Err(Error::Conflict {
                    key: key.to_owned(),
                });
            }
            match new {
                Some(bytes) => txn.put_raw(key, bytes),
                None => txn.delete(key),
            }
        })
    }

    /// Number of rows under `prefix`. Intended for stats and tests.
    pub fn count_prefix(&self, prefix: &str) -> Result<u64> {
        let txn = self.db.begin_read().map_err(internal)?;
        let table = txn.open_table(META).map_err(internal)?;
        let mut count = 0u64;
        for row in table.range(prefix..).map_err(internal)? {
            let (key, _) = row.map_err(internal)?;
            if !key.value().starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}

/// Shared scan implementation for read and write transactions.
fn scan_table<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    prefix: &str,
    start_after: Option<&str>,
    limit: usize,
) -> Result<Vec<(String, Vec<u8>)>> {
    let start = start_after.filter(|s| s.as_bytes() >= prefix.as_bytes());
    let mut rows = Vec::new();

    let range = match start {
        Some(s) => table.range::<&str>((std::ops::Bound::Excluded(s), std::ops::Bound::Unbounded)),
        None => table.range(prefix..),
    }
    .map_err(internal)?;

    for row in range {
        if rows.len() >= limit {
            break;
        }
        let (key, value) = row.map_err(internal)?;
        let key_str = key.value();
        if !key_str.starts_with(prefix) {
            break;
        }
        rows.push((key_str.to_owned(), value.value().to_vec()));
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// MetaTxn
// ---------------------------------------------------------------------------

/// Handle to an open write transaction, passed to [`MetaStore::update`]
/// closures.
pub struct MetaTxn<'t> {
    table: redb::Table<'t, &'static str, &'static [u8]>,
}

impl std::fmt::Debug for MetaTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaTxn").finish_non_exhaustive()
    }
}

impl MetaTxn<'_> {
    /// Read the raw bytes at `key` within this transaction.
    pub fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .table
            .get(key)
            .map_err(internal)?
            .map(|guard| guard.value().to_vec()))
    }

    /// Read and decode the record at `key` within this transaction.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Write raw bytes at `key`.
    pub fn put_raw(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.table.insert(key, value).map_err(internal)?;
        Ok(())
    }

    /// Encode and write a record at `key`.
    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(internal)?;
        self.put_raw(key, &bytes)
    }

    /// Delete the record at `key`. Idempotent.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.table.remove(key).map_err(internal)?;
        Ok(())
    }

    /// Whether a record exists at `key`.
    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.table.get(key).map_err(internal)?.is_some())
    }

    /// Scan up to `limit` rows under `prefix` within this transaction.
    pub fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        scan_table(&self.table, prefix, start_after, limit)
    }

    /// Decode every row under `prefix` as `T`.
    pub fn scan_values<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let rows = self.scan_prefix(prefix, None, usize::MAX)?;
        rows.iter()
            .map(|(key, bytes)| decode(key, bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        name: String,
        count: u64,
    }

    fn open_store() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::TempDir::new().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
        let store = MetaStore::open(dir.path().join("meta.redb"))
            .unwrap_or_else(|e| panic!("open failed: {e}"));
        (dir, store)
    }

    #[test]
    fn test_should_roundtrip_record() {
        let (_dir, store) = open_store();
        let rec = Rec {
            name: "a".to_owned(),
            count: 7,
        };
        store
            .put("tenant:1", &rec)
            .unwrap_or_else(|e| panic!("put failed: {e}"));

        let loaded: Option<Rec> = store
            .get("tenant:1")
            .unwrap_or_else(|e| panic!("get failed: {e}"));
        assert_eq!(loaded, Some(rec));
    }

    #[test]
    fn test_should_return_none_for_missing_key() {
        let (_dir, store) = open_store();
        let loaded: Option<Rec> = store
            .get("tenant:missing")
            .unwrap_or_else(|e| panic!("get failed: {e}"));
        assert!(loaded.is_none());
    }

    #[test]
    fn test_should_delete_idempotently() {
        let (_dir, store) = open_store();
        store
            .put(
                "user:1",
                &Rec {
                    name: "x".to_owned(),
                    count: 0,
                },
            )
            .unwrap_or_else(|e| panic!("put failed: {e}"));

        store
            .delete("user:1")
            .unwrap_or_else(|e| panic!("delete failed: {e}"));
        // A second delete of a missing key succeeds too.
        store
            .delete("user:1")
            .unwrap_or_else(|e| panic!("second delete failed: {e}"));
        assert!(store.get_raw("user:1").unwrap().is_none());
    }

    #[test]
    fn test_should_scan_prefix_in_order_with_limit_and_marker() {
        let (_dir, store) = open_store();
        for name in ["bucket:alpha", "bucket:beta", "bucket:gamma", "node:1"] {
            store
                .put(
                    name,
                    &Rec {
                        name: name.to_owned(),
                        count: 0,
                    },
                )
                .unwrap_or_else(|e| panic!("put failed: {e}"));
        }

        let all = store
            .scan_prefix("bucket:", None, usize::MAX)
            .unwrap_or_else(|e| panic!("scan failed: {e}"));
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["bucket:alpha", "bucket:beta", "bucket:gamma"]);

        let limited = store.scan_prefix("bucket:", None, 2).unwrap();
        assert_eq!(limited.len(), 2);

        let after = store
            .scan_prefix("bucket:", Some("bucket:beta"), usize::MAX)
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, "bucket:gamma");
    }

    #[test]
    fn test_should_abort_transaction_on_closure_error() {
        let (_dir, store) = open_store();
        let result: Result<()> = store.update(|txn| {
            txn.put(
                "bucket:doomed",
                &Rec {
                    name: "doomed".to_owned(),
                    count: 0,
                },
            )?;
            Err(Error::invalid_argument("abort"))
        });
        assert!(result.is_err());
        assert!(
            store.get_raw("bucket:doomed").unwrap().is_none(),
            "aborted write must not be visible"
        );
    }

    #[test]
    fn test_should_commit_multi_key_transaction_atomically() {
        let (_dir, store) = open_store();
        store
            .update(|txn| {
                txn.put(
                    "tenant:t",
                    &Rec {
                        name: "t".to_owned(),
                        count: 1,
                    },
                )?;
                txn.put(
                    "bucket:b",
                    &Rec {
                        name: "b".to_owned(),
                        count: 2,
                    },
                )?;
                txn.delete("bucket:old")
            })
            .unwrap_or_else(|e| panic!("update failed: {e}"));

        assert!(store.get_raw("tenant:t").unwrap().is_some());
        assert!(store.get_raw("bucket:b").unwrap().is_some());
    }

    #[test]
    fn test_should_enforce_compare_and_swap() {
        let (_dir, store) = open_store();
        store
            .compare_and_swap("counter", None, Some(b"1"))
            .unwrap_or_else(|e| panic!("initial cas failed: {e}"));

        // Correct expectation succeeds.
        store
            .compare_and_swap("counter", Some(b"1"), Some(b"2"))
            .unwrap_or_else(|e| panic!("cas failed: {e}"));

        // Stale expectation conflicts and leaves the value untouched.
        let result = store.compare_and_swap("counter", Some(b"1"), Some(b"3"));
        assert!(matches!(result, Err(Error::Conflict { .. })));
        assert_eq!(store.get_raw("counter").unwrap().as_deref(), Some(&b"2"[..]));

        // CAS to None deletes.
        store
            .compare_and_swap("counter", Some(b"2"), None)
            .unwrap_or_else(|e| panic!("cas delete failed: {e}"));
        assert!(store.get_raw("counter").unwrap().is_none());
    }

    #[test]
    fn test_should_persist_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("meta.redb");
        {
            let store = MetaStore::open(&path).unwrap();
            store
                .put(
                    "bucket:persisted",
                    &Rec {
                        name: "p".to_owned(),
                        count: 9,
                    },
                )
                .unwrap_or_else(|e| panic!("put failed: {e}"));
        }
        let store = MetaStore::open(&path).unwrap();
        let loaded: Option<Rec> = store.get("bucket:persisted").unwrap();
        assert_eq!(loaded.map(|r| r.count), Some(9));
    }

    #[test]
    fn test_should_count_prefix_rows() {
        let (_dir, store) = open_store();
        for i in 0..5 {
            store
                .put(
                    &format!("replq:{i}"),
                    &Rec {
                        name: i.to_string(),
                        count: i,
                    },
                )
                .unwrap();
        }
        assert_eq!(store.count_prefix("replq:").unwrap(), 5);
        assert_eq!(store.count_prefix("tomb:").unwrap(), 0);
    }
}
