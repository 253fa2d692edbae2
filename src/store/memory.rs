//! In-memory ordered tables.

use super::{Entry, MergeFn, SnapshotStore};
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Table set shared by the memory and file stores.
///
/// Each table has its own lock; an upsert holds its table's write lock while
/// the merge callback runs, which serializes writers of the same key.
#[derive(Default)]
pub(crate) struct Tables {
    tables: RwLock<HashMap<String, Arc<RwLock<Table>>>>,
}

impl Tables {
    fn table(&self, name: &str) -> Option<Arc<RwLock<Table>>> {
        self.tables.read().get(name).cloned()
    }

    fn table_or_create(&self, name: &str) -> Arc<RwLock<Table>> {
        if let Some(table) = self.table(name) {
            return table;
        }
        let mut tables = self.tables.write();
        Arc::clone(tables.entry(name.to_string()).or_default())
    }

    /// Compute and apply an upsert.
    ///
    /// `persist` sees the final value before it becomes visible; if it fails
    /// the table is left unchanged.
    pub(crate) fn upsert_with<P>(
        &self,
        table: &str,
        key: &[u8],
        value: Vec<u8>,
        merge: MergeFn<'_>,
        persist: P,
    ) -> Result<()>
    where
        P: FnOnce(&[u8]) -> Result<()>,
    {
        let table = self.table_or_create(table);
        let mut rows = table.write();

        let stored = match rows.get(key) {
            Some(origin) => merge(origin.as_slice(), value.as_slice()),
            None => value,
        };

        persist(&stored)?;
        rows.insert(key.to_vec(), stored);
        Ok(())
    }

    pub(crate) fn delete_with<P>(&self, table: &str, key: &[u8], persist: P) -> Result<()>
    where
        P: FnOnce() -> Result<()>,
    {
        let table = match self.table(table) {
            Some(t) => t,
            None => return Ok(()),
        };
        let mut rows = table.write();

        if !rows.contains_key(key) {
            return Ok(());
        }

        persist()?;
        rows.remove(key);
        Ok(())
    }

    /// Apply a replayed write without merging.
    pub(crate) fn put_raw(&self, table: &str, key: Vec<u8>, value: Vec<u8>) {
        self.table_or_create(table).write().insert(key, value);
    }

    pub(crate) fn remove_raw(&self, table: &str, key: &[u8]) {
        if let Some(t) = self.table(table) {
            t.write().remove(key);
        }
    }

    pub(crate) fn get(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.table(table).and_then(|t| t.read().get(key).cloned())
    }

    pub(crate) fn scan(&self, table: &str, from: Bound<&[u8]>, limit: usize) -> Vec<Entry> {
        let table = match self.table(table) {
            Some(t) => t,
            None => return Vec::new(),
        };
        let rows = table.read();

        rows.range::<[u8], _>((from, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn len(&self, table: &str) -> usize {
        self.table(table).map(|t| t.read().len()).unwrap_or(0)
    }

    /// Every live row, table by table (for log compaction).
    pub(crate) fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[u8], &[u8]) -> Result<()>,
    {
        let tables: Vec<(String, Arc<RwLock<Table>>)> = self
            .tables
            .read()
            .iter()
            .map(|(name, t)| (name.clone(), Arc::clone(t)))
            .collect();

        for (name, table) in tables {
            for (k, v) in table.read().iter() {
                f(&name, k, v)?;
            }
        }
        Ok(())
    }

    pub(crate) fn row_count(&self) -> usize {
        self.tables.read().values().map(|t| t.read().len()).sum()
    }
}

/// Volatile snapshot store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Tables,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn upsert(&self, table: &str, key: &[u8], value: Vec<u8>, merge: MergeFn<'_>) -> Result<()> {
        self.tables.upsert_with(table, key, value, merge, |_| Ok(()))
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        self.tables.delete_with(table, key, || Ok(()))
    }

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.get(table, key))
    }

    fn scan(&self, table: &str, from: Bound<&[u8]>, limit: usize) -> Result<Vec<Entry>> {
        Ok(self.tables.scan(table, from, limit))
    }

    fn len(&self, table: &str) -> Result<usize> {
        Ok(self.tables.len(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat(origin: &[u8], incoming: &[u8]) -> Vec<u8> {
        [origin, incoming].concat()
    }

    #[test]
    fn test_upsert_inserts_then_merges() {
        let store = MemoryStore::new();

        store.upsert("t", b"k", b"a".to_vec(), &concat).unwrap();
        assert_eq!(store.get("t", b"k").unwrap().unwrap(), b"a");

        store.upsert("t", b"k", b"b".to_vec(), &concat).unwrap();
        assert_eq!(store.get("t", b"k").unwrap().unwrap(), b"ab");
    }

    #[test]
    fn test_first_insert_does_not_call_merge() {
        let store = MemoryStore::new();
        let panic_merge = |_: &[u8], _: &[u8]| -> Vec<u8> { panic!("merge called") };

        store.upsert("t", b"k", b"v".to_vec(), &panic_merge).unwrap();
        assert_eq!(store.len("t").unwrap(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.upsert("t", b"k", b"v".to_vec(), &concat).unwrap();

        store.delete("t", b"k").unwrap();
        store.delete("t", b"k").unwrap();
        store.delete("missing-table", b"k").unwrap();

        assert!(store.get("t", b"k").unwrap().is_none());
    }

    #[test]
    fn test_tables_are_isolated() {
        let store = MemoryStore::new();
        store.upsert("a", b"k", b"1".to_vec(), &concat).unwrap();
        store.upsert("b", b"k", b"2".to_vec(), &concat).unwrap();

        assert_eq!(store.get("a", b"k").unwrap().unwrap(), b"1");
        assert_eq!(store.get("b", b"k").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_scan_bounds() {
        let store = MemoryStore::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.upsert("t", k, k.to_vec(), &concat).unwrap();
        }

        let keys = |from, limit| -> Vec<Vec<u8>> {
            store
                .scan("t", from, limit)
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect()
        };

        assert_eq!(keys(Bound::Unbounded, 10).len(), 4);
        assert_eq!(keys(Bound::Included(b"b".as_slice()), 2), vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(keys(Bound::Excluded(b"b".as_slice()), 10), vec![b"c".to_vec(), b"d".to_vec()]);
        assert!(keys(Bound::Excluded(b"d".as_slice()), 10).is_empty());
        assert!(store.scan("nope", Bound::Unbounded, 10).unwrap().is_empty());
    }
}
