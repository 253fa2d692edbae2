//! File-backed snapshot store.
//!
//! Layout of a store directory:
//!
//! - `MANIFEST`: magic + format version;
//! - `LOCK`: held exclusively while the store is open;
//! - `snapshot.log`: append-only log of puts and deletes.
//!
//! Each log entry is `len (u32 LE) | MessagePack entry | crc32 (u32 LE)`.
//! On open the log is replayed into memory. A torn or corrupt tail (from a
//! crash mid-write) is truncated at the last good entry.
//!
//! Every update appends the whole merged value, so the log is rewritten with
//! one entry per live row once superseded entries dominate it, both on open
//! and after writes.

use super::memory::Tables;
use super::{Entry, MergeFn, SnapshotStore};
use crate::error::{Result, SnapshotError};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"SNP\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Upper bound for one log entry; anything larger is treated as corruption.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

const LOG_FILE: &str = "snapshot.log";

/// File store configuration.
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Store directory.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync every N writes (0 and 1 both mean every write).
    pub sync_interval: u64,

    /// Smallest log that is compacted automatically. 0 turns automatic
    /// compaction off.
    pub compact_min_entries: u64,

    /// Compact once the log holds more than this many entries per live row.
    pub compact_ratio: u64,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./snapshot"),
            create_if_missing: true,
            sync_interval: 100,
            compact_min_entries: 4096,
            compact_ratio: 4,
        }
    }
}

/// One durable write.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum LogEntry {
    Put {
        table: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: Vec<u8>,
    },
}

struct LogWriter {
    writer: BufWriter<File>,
    writes_since_sync: u64,
    /// Entries in the log, live or superseded.
    entries: u64,
}

/// Durable snapshot store.
pub struct FileStore {
    config: FileStoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    tables: Tables,

    /// Held shared by writers and exclusively by compaction, which takes
    /// the log lock before the table locks.
    writers: RwLock<()>,

    log: Mutex<LogWriter>,
}

impl FileStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: FileStoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(SnapshotError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log_path = config.path.join(LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
        file.sync_all()?;

        info!(path = %config.path.display(), "Created snapshot store");

        Ok(Self {
            config,
            _lock_file: lock_file,
            writers: RwLock::new(()),
            tables: Tables::default(),
            log: Mutex::new(LogWriter {
                writer: BufWriter::new(OpenOptions::new().append(true).open(&log_path)?),
                writes_since_sync: 0,
                entries: 0,
            }),
        })
    }

    /// Open an existing store and replay its log.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let log_path = config.path.join(LOG_FILE);
        let tables = Tables::default();
        let entries = Self::replay(&log_path, &tables)?;

        info!(
            path = %config.path.display(),
            entries,
            rows = tables.row_count(),
            "Opened snapshot store"
        );

        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let store = Self {
            config,
            _lock_file: lock_file,
            writers: RwLock::new(()),
            tables,
            log: Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                writes_since_sync: 0,
                entries,
            }),
        };
        store.compact_if_needed()?;

        Ok(store)
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of log entries, including superseded ones.
    pub fn log_entries(&self) -> u64 {
        self.log.lock().entries
    }

    /// Rewrite the log so it holds exactly one put per live row.
    pub fn compact(&self) -> Result<()> {
        let _writers = self.writers.write();
        let mut log = self.log.lock();
        self.rewrite_log(&mut log)
    }

    /// Compact when superseded entries pass the configured ratio.
    ///
    /// Must not be called while holding the writers gate or a table lock.
    fn compact_if_needed(&self) -> Result<()> {
        let entries = self.log.lock().entries;
        if !self.needs_compaction(entries) {
            return Ok(());
        }

        let _writers = self.writers.write();
        let mut log = self.log.lock();
        // Another writer may have compacted first
        if !self.needs_compaction(log.entries) {
            return Ok(());
        }
        self.rewrite_log(&mut log)
    }

    fn needs_compaction(&self, entries: u64) -> bool {
        let min = self.config.compact_min_entries;
        if min == 0 || entries < min {
            return false;
        }

        let live = self.tables.row_count() as u64;
        entries > live.max(1).saturating_mul(self.config.compact_ratio.max(1))
    }

    fn rewrite_log(&self, log: &mut LogWriter) -> Result<()> {
        log.writer.flush()?;

        let tmp_path = self.config.path.join(format!("{}.compact", LOG_FILE));
        let mut entries = 0u64;
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            self.tables.for_each(|table, key, value| {
                Self::write_entry(
                    &mut tmp,
                    &LogEntry::Put {
                        table: table.to_string(),
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                )?;
                entries += 1;
                Ok(())
            })?;
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        let log_path = self.config.path.join(LOG_FILE);
        fs::rename(&tmp_path, &log_path)?;

        let before = log.entries;
        log.writer = BufWriter::new(OpenOptions::new().append(true).open(&log_path)?);
        log.writes_since_sync = 0;
        log.entries = entries;

        info!(before, after = entries, "Compacted snapshot log");
        Ok(())
    }

    fn append(&self, entry: &LogEntry) -> Result<()> {
        let mut log = self.log.lock();
        Self::write_entry(&mut log.writer, entry)?;
        log.writer.flush()?;
        log.entries += 1;

        log.writes_since_sync += 1;
        if log.writes_since_sync >= self.config.sync_interval.max(1) {
            log.writer.get_ref().sync_data()?;
            log.writes_since_sync = 0;
        }
        Ok(())
    }

    /// Replay the log into `tables`; returns the number of entries applied.
    fn replay(path: &Path, tables: &Tables) -> Result<u64> {
        if !path.exists() {
            return Ok(0);
        }

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut applied = 0u64;
        let mut good_offset = 0u64;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, size))) => {
                    match entry {
                        LogEntry::Put { table, key, value } => tables.put_raw(&table, key, value),
                        LogEntry::Delete { table, key } => tables.remove_raw(&table, &key),
                    }
                    applied += 1;
                    good_offset += size;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        offset = good_offset,
                        error = %e,
                        "Truncating snapshot log at corrupt entry"
                    );
                    break;
                }
            }
        }

        if good_offset < file_len {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(good_offset)?;
            file.sync_all()?;
            debug!(from = file_len, to = good_offset, "Truncated snapshot log");
        }

        Ok(applied)
    }

    fn write_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        Ok(())
    }

    /// Read one entry. `Ok(None)` at a clean end of file.
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(LogEntry, u64)>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(SnapshotError::Corruption("log entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);

        if stored != computed {
            return Err(SnapshotError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let entry = rmp_serde::from_slice(&encoded)?;
        Ok(Some((entry, (len + 8) as u64)))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(SnapshotError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(SnapshotError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SnapshotError::Locked)?;

        Ok(lock_file)
    }
}

impl SnapshotStore for FileStore {
    fn upsert(&self, table: &str, key: &[u8], value: Vec<u8>, merge: MergeFn<'_>) -> Result<()> {
        {
            let _writers = self.writers.read();
            self.tables.upsert_with(table, key, value, merge, |stored| {
                self.append(&LogEntry::Put {
                    table: table.to_string(),
                    key: key.to_vec(),
                    value: stored.to_vec(),
                })
            })?;
        }
        self.compact_if_needed()
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<()> {
        {
            let _writers = self.writers.read();
            self.tables.delete_with(table, key, || {
                self.append(&LogEntry::Delete {
                    table: table.to_string(),
                    key: key.to_vec(),
                })
            })?;
        }
        self.compact_if_needed()
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

    fn sync(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.writer.flush()?;
        log.writer.get_ref().sync_all()?;
        log.writes_since_sync = 0;
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
