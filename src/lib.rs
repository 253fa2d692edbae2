//! # Gravity Snapshot
//!
//! Materializes the latest state of every record from a partitioned stream
//! of change events.
//!
//! ## Core Concepts
//!
//! - **Collections**: one event stream each, split into partitions with a
//!   durable consumer per partition
//! - **Merge**: every insert/update is deep-merged into the stored record;
//!   arrays are replaced, maps merged, deletes clear the key
//! - **Revision**: the stream sequence of the last applied event, kept in the
//!   record's metadata
//! - **Views**: subscriber cursors that publish snapshot batches on request
//!
//! ## Example
//!
//! ```ignore
//! use gravity_snapshot::{MemoryBroker, Service, SnapshotConfig};
//!
//! let mut config = SnapshotConfig::default();
//! config.add_collections(["users"]);
//!
//! let service = Service::new(config, Arc::new(MemoryBroker::new()))?;
//! service.start()?;
//!
//! // ... events published to gravity.COLLECTION.users.<partition>.EVENT.* ...
//!
//! service.stop();
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod merge;
pub mod rpc;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod transport;
pub mod types;
pub mod views;
pub mod watcher;

// Re-exports
pub use config::{SnapshotConfig, StoreSettings};
pub use connector::Connector;
pub use error::{Result, SnapshotError};
pub use merge::{apply_changes, RecordMerger, SnapshotHandler};
pub use rpc::{SnapshotClient, SnapshotRpc};
pub use service::Service;
pub use snapshot::{Snapshot, SnapshotRequest, WorkerPool, WorkerStats};
pub use store::{open_store, FileStore, FileStoreConfig, MemoryStore, SnapshotStore};
pub use transport::{EventTransport, MemoryBroker, Message, Subscription};
pub use types::*;
pub use views::{PulledRecord, View, ViewManager};
pub use watcher::{Collection, CollectionWatcher, WatchCallback};
