//! Keyed snapshot storage.
//!
//! The merge engine only depends on [`SnapshotStore`]: an upsert that takes a
//! merge callback, and a delete. Both are atomic per key. Two implementations
//! are provided:
//!
//! - [`MemoryStore`]: ordered in-memory tables, lost on restart;
//! - [`FileStore`]: the same tables backed by an append-only, checksummed log
//!   that is replayed on open.

mod file;
mod memory;

pub use file::{FileStore, FileStoreConfig};
pub use memory::MemoryStore;

use crate::error::Result;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::Arc;

/// Merge callback passed to [`SnapshotStore::upsert`].
///
/// Called as `merge(origin, incoming)` when the key already holds `origin`;
/// returns the bytes to store. Implementations may call it any number of
/// times, so it must be a pure function of its arguments.
pub type MergeFn<'a> = &'a (dyn Fn(&[u8], &[u8]) -> Vec<u8> + Sync);

/// A stored key/value pair returned by scans.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Keyed store of encoded snapshot records, partitioned by table.
pub trait SnapshotStore: Send + Sync {
    /// Insert `value` for `key`, or replace the existing value with
    /// `merge(existing, value)`.
    fn upsert(&self, table: &str, key: &[u8], value: Vec<u8>, merge: MergeFn<'_>) -> Result<()>;

    /// Remove `key`. Removing an absent key succeeds.
    fn delete(&self, table: &str, key: &[u8]) -> Result<()>;

    /// Read the current value of `key`.
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Up to `limit` entries of `table` in key order, starting at `from`.
    fn scan(&self, table: &str, from: Bound<&[u8]>, limit: usize) -> Result<Vec<Entry>>;

    /// Number of keys stored in `table`.
    fn len(&self, table: &str) -> Result<usize>;

    /// Flush buffered writes to durable storage. No-op for volatile stores.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the store selected by `path`: a [`FileStore`] when set, a
/// [`MemoryStore`] otherwise.
pub fn open_store(path: Option<&PathBuf>) -> Result<Arc<dyn SnapshotStore>> {
    match path {
        Some(path) => {
            let store = FileStore::open_or_create(FileStoreConfig {
                path: path.clone(),
                ..Default::default()
            })?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}
