//! Snapshot worker pool.
//!
//! Requests are routed to a fixed worker by (collection, partition), so the
//! events of one partition are applied in delivery order while different
//! partitions proceed in parallel.

use crate::error::{Result, SnapshotError};
use crate::merge::SnapshotHandler;
use crate::types::Meta;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, Span};

/// One delivered event waiting to be applied.
#[derive(Clone, Debug)]
pub struct SnapshotRequest {
    pub collection: String,
    pub partition: u64,
    pub meta: Meta,
    pub data: Vec<u8>,
}

/// Pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Requests waiting in queues.
    pub queued: usize,
    /// Requests applied, successfully or not.
    pub processed: u64,
    /// Requests whose store write failed.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Fixed set of worker threads, each draining its own bounded queue.
pub struct WorkerPool {
    senders: RwLock<Vec<Sender<SnapshotRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
    span: Span,
}

impl WorkerPool {
    /// Start `count` workers with queues of `buffer_size` requests.
    pub fn new(count: usize, buffer_size: usize, handler: Arc<SnapshotHandler>, span: Span) -> Result<Self> {
        if count == 0 {
            return Err(SnapshotError::Config("worker pool needs at least one worker".into()));
        }

        let counters = Arc::new(Counters::default());
        let mut senders = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);

        for i in 0..count {
            let (tx, rx) = bounded(buffer_size.max(1));
            let handler = Arc::clone(&handler);
            let counters = Arc::clone(&counters);
            let worker_span = span.clone();

            let handle = std::thread::Builder::new()
                .name(format!("snapshot-worker-{}", i))
                .spawn(move || worker_loop(i, rx, &handler, &counters, &worker_span))?;

            senders.push(tx);
            workers.push(handle);
        }

        debug!(parent: &span, workers = count, buffer_size, "Started snapshot workers");

        Ok(Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            counters,
            span,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.senders.read().len()
    }

    /// Queue a request on its partition's worker.
    ///
    /// Blocks while that worker's queue is full. Fails with `WorkersStopped`
    /// after [`WorkerPool::shutdown`].
    pub fn submit(&self, request: SnapshotRequest) -> Result<()> {
        let sender = {
            let senders = self.senders.read();
            if senders.is_empty() {
                return Err(SnapshotError::WorkersStopped);
            }
            let index = route(&request.collection, request.partition, senders.len());
            senders[index].clone()
        };

        sender.send(request).map_err(|_| SnapshotError::WorkersStopped)
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            queued: self.senders.read().iter().map(Sender::len).sum(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Close the queues and wait for the workers to apply what is queued.
    pub fn shutdown(&self) {
        let senders = std::mem::take(&mut *self.senders.write());
        drop(senders);

        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        for handle in workers {
            let _ = handle.join();
        }

        if count > 0 {
            debug!(parent: &self.span, workers = count, "Snapshot workers stopped");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker index for a (collection, partition) pair.
fn route(collection: &str, partition: u64, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    collection.hash(&mut hasher);
    partition.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

fn worker_loop(
    id: usize,
    requests: Receiver<SnapshotRequest>,
    handler: &SnapshotHandler,
    counters: &Counters,
    span: &Span,
) {
    let _enter = span.enter();

    for request in requests.iter() {
        if let Err(e) = handler.handle(&request.meta, &request.data) {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                worker = id,
                collection = %request.collection,
                partition = request.partition,
                error = %e,
                "Failed to apply snapshot event"
            );
        }
        counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}
