//! Snapshot orchestrator.
//!
//! Wires the collection watcher to the merge engine: every delivered message
//! gets `{revision: <stream sequence>}` as its metadata and is applied either
//! by the worker pool or inline on the consumer thread.

mod workers;

pub use workers::{SnapshotRequest, WorkerPool, WorkerStats};

use crate::error::Result;
use crate::merge::SnapshotHandler;
use crate::transport::Message;
use crate::types::Meta;
use crate::watcher::{CollectionWatcher, WatchCallback};
use std::sync::Arc;
use tracing::{info, warn, Span};

/// Metadata key holding the stream sequence of the last applied event.
pub const REVISION_KEY: &str = "revision";

/// Metadata recorded with an event's effect on the stored record.
pub fn delivery_meta(message: &Message) -> Meta {
    let mut meta = Meta::new();
    if let Some(metadata) = &message.metadata {
        meta.insert(REVISION_KEY.to_string(), metadata.stream_sequence.0.into());
    }
    meta
}

/// Consumes collection events into the snapshot store.
pub struct Snapshot {
    handler: Arc<SnapshotHandler>,
    watcher: Arc<CollectionWatcher>,
    /// `None` applies events inline on the consumer thread.
    workers: Option<Arc<WorkerPool>>,
    span: Span,
}

impl Snapshot {
    /// Build the orchestrator. `worker_count == 0` selects inline mode.
    pub fn new(
        handler: Arc<SnapshotHandler>,
        watcher: Arc<CollectionWatcher>,
        worker_count: usize,
        worker_buffer_size: usize,
        span: Span,
    ) -> Result<Self> {
        let workers = if worker_count == 0 {
            None
        } else {
            let pool = WorkerPool::new(worker_count, worker_buffer_size, Arc::clone(&handler), span.clone())?;
            Some(Arc::new(pool))
        };

        Ok(Self {
            handler,
            watcher,
            workers,
            span,
        })
    }

    pub fn handler(&self) -> &Arc<SnapshotHandler> {
        &self.handler
    }

    pub fn watcher(&self) -> &Arc<CollectionWatcher> {
        &self.watcher
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.workers.as_ref().map(|w| w.stats())
    }

    /// Start consuming every registered collection.
    pub fn start(&self) -> Result<()> {
        let _enter = self.span.enter();

        self.watcher.watch(self.callback())?;

        info!(
            collections = ?self.watcher.collection_names(),
            inline = self.workers.is_none(),
            "Snapshot started"
        );
        Ok(())
    }

    /// Detach consumers, then apply whatever is still queued.
    pub fn stop(&self) {
        self.watcher.stop();
        if let Some(workers) = &self.workers {
            workers.shutdown();
        }
    }

    fn callback(&self) -> WatchCallback {
        let handler = Arc::clone(&self.handler);
        let workers = self.workers.clone();

        Arc::new(move |collection: &str, partition: u64, message: &Message| {
            if message.metadata.is_none() {
                warn!(collection, partition, subject = %message.subject, "Delivery without stream metadata");
            }
            let meta = delivery_meta(message);

            match &workers {
                Some(pool) => pool.submit(SnapshotRequest {
                    collection: collection.to_string(),
                    partition,
                    meta,
                    data: message.data.clone(),
                }),
                None => handler.handle(&meta, &message.data),
            }
        })
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.stop();
    }
}
