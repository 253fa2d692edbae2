//! Composition root.
//!
//! [`Service`] builds the components in dependency order: connector, store,
//! merge engine, watcher, orchestrator, views, view API.

use crate::config::SnapshotConfig;
use crate::connector::Connector;
use crate::error::{Result, SnapshotError};
use crate::merge::SnapshotHandler;
use crate::rpc::SnapshotRpc;
use crate::snapshot::{Snapshot, WorkerStats};
use crate::store::{open_store, SnapshotStore};
use crate::transport::EventTransport;
use crate::views::ViewManager;
use crate::watcher::CollectionWatcher;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info, info_span, Span};

/// Components alive between `start` and `stop`.
struct Running {
    store: Arc<dyn SnapshotStore>,
    snapshot: Snapshot,
    views: Arc<ViewManager>,
    rpc: SnapshotRpc,
}

/// The snapshot service.
pub struct Service {
    config: SnapshotConfig,
    connector: Connector,
    running: Mutex<Option<Running>>,
    span: Span,
}

impl Service {
    pub fn new(config: SnapshotConfig, transport: Arc<dyn EventTransport>) -> Result<Self> {
        config.validate()?;

        let span = info_span!("snapshot", domain = %config.domain);
        let connector = Connector::new(
            config.domain.as_str(),
            transport,
            info_span!(parent: &span, "connector"),
        );

        Ok(Self {
            config,
            connector,
            running: Mutex::new(None),
            span,
        })
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Open the store and start consuming every configured collection.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SnapshotError::InvalidOperation("service already started".into()));
        }

        self.connector.ensure_connected()?;

        let store = open_store(self.config.store.path.as_ref())?;
        let transport = Arc::clone(self.connector.transport());

        let handler = Arc::new(SnapshotHandler::new(
            Arc::clone(&store),
            info_span!(parent: &self.span, "merge"),
        ));

        let watcher = Arc::new(CollectionWatcher::new(
            self.config.domain.as_str(),
            Arc::clone(&transport),
            self.config.partition_count,
            info_span!(parent: &self.span, "watcher"),
        ));
        for name in &self.config.collections {
            watcher.register_collection(name)?;
        }

        let snapshot = Snapshot::new(
            handler,
            watcher,
            self.config.store.worker_count,
            self.config.store.worker_buffer_size,
            info_span!(parent: &self.span, "orchestrator"),
        )?;
        snapshot.start()?;

        let views = Arc::new(ViewManager::new(
            self.config.domain.as_str(),
            Arc::clone(&store),
            Arc::clone(&transport),
            self.config.pull_batch_size,
            info_span!(parent: &self.span, "views"),
        ));

        let rpc = SnapshotRpc::new(
            &self.config.domain,
            Arc::clone(&views),
            transport,
            info_span!(parent: &self.span, "rpc"),
        );
        rpc.register()?;

        info!(
            parent: &self.span,
            store = ?self.config.store.path,
            collections = self.config.collections.len(),
            "Snapshot service started"
        );

        *running = Some(Running {
            store,
            snapshot,
            views,
            rpc,
        });
        Ok(())
    }

    /// Start watching another collection while running.
    pub fn add_collection(&self, name: &str) -> Result<()> {
        let running = self.running.lock();
        let running = running
            .as_ref()
            .ok_or_else(|| SnapshotError::InvalidOperation("service not started".into()))?;

        running.snapshot.watcher().register_collection(name)?;
        running.snapshot.start()
    }

    /// Disconnect the transport, then apply events that are already queued.
    pub fn stop(&self) {
        let running = match self.running.lock().take() {
            Some(r) => r,
            None => return,
        };

        self.connector.disconnect();
        running.rpc.stop();
        running.snapshot.stop();

        if let Err(e) = running.store.sync() {
            error!(parent: &self.span, error = %e, "Failed to sync snapshot store");
        }

        info!(parent: &self.span, "Snapshot service stopped");
    }

    pub fn store(&self) -> Option<Arc<dyn SnapshotStore>> {
        self.running.lock().as_ref().map(|r| Arc::clone(&r.store))
    }

    pub fn views(&self) -> Option<Arc<ViewManager>> {
        self.running.lock().as_ref().map(|r| Arc::clone(&r.views))
    }

    /// Worker pool counters; `None` when stopped or running inline.
    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.running.lock().as_ref().and_then(|r| r.snapshot.worker_stats())
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}
