//! Partition-aware collection watcher.
//!
//! Keeps a registry of collection names and, on [`CollectionWatcher::watch`],
//! attaches one durable consumer per (collection, partition). Consumers are
//! named after the collection and partition, so a restarted process resumes
//! where the previous one acknowledged.

mod collection;

pub use collection::Collection;

use crate::config::validate_collection_name;
use crate::error::{Result, SnapshotError};
use crate::transport::{ConsumerConfig, EventTransport, Message, MessageHandler, StreamConfig, Subscription};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, Span};

/// Called for every delivery with the collection name and partition.
pub type WatchCallback = Arc<dyn Fn(&str, u64, &Message) -> Result<()> + Send + Sync>;

/// Registry of watched collections and their live subscriptions.
pub struct CollectionWatcher {
    domain: String,
    transport: Arc<dyn EventTransport>,
    partitions: Vec<u64>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    /// Live consumers by collection name. Kept apart from the registry so
    /// unregistering a collection leaves its consumers running.
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    span: Span,
}

impl CollectionWatcher {
    /// Watcher for partitions `0..partition_count`.
    pub fn new(
        domain: impl Into<String>,
        transport: Arc<dyn EventTransport>,
        partition_count: u64,
        span: Span,
    ) -> Self {
        Self::with_partitions(domain, transport, (0..partition_count).collect(), span)
    }

    /// Watcher for an explicit partition list.
    pub fn with_partitions(
        domain: impl Into<String>,
        transport: Arc<dyn EventTransport>,
        partitions: Vec<u64>,
        span: Span,
    ) -> Self {
        Self {
            domain: domain.into(),
            transport,
            partitions,
            collections: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            span,
        }
    }

    pub fn partitions(&self) -> &[u64] {
        &self.partitions
    }

    /// Register a collection. Registering twice returns the existing entry.
    pub fn register_collection(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Arc::clone(existing));
        }

        validate_collection_name(name)?;

        let mut collections = self.collections.write();
        let entry = collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collection::new(self.domain.as_str(), name)));

        Ok(Arc::clone(entry))
    }

    /// Remove a collection from the registry. Unknown names are ignored.
    pub fn unregister_collection(&self, name: &str) {
        self.collections.write().remove(name);
    }

    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    /// Registered collection names, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether consumers are attached for `name`.
    pub fn is_watching(&self, name: &str) -> bool {
        self.subscriptions.lock().contains_key(name)
    }

    /// Attach consumers for every registered collection not attached yet.
    ///
    /// A collection whose setup fails is logged and skipped; the others are
    /// still attached. Fails only if the transport is not connected.
    pub fn watch(&self, callback: WatchCallback) -> Result<()> {
        let _enter = self.span.enter();

        if !self.transport.is_connected() {
            return Err(SnapshotError::Disconnected);
        }

        let pending: Vec<Arc<Collection>> = {
            let attached = self.subscriptions.lock();
            let mut pending: Vec<Arc<Collection>> = self
                .collections
                .read()
                .values()
                .filter(|c| !attached.contains_key(c.name()))
                .cloned()
                .collect();
            pending.sort_by(|a, b| a.name().cmp(b.name()));
            pending
        };

        for collection in pending {
            match self.attach(&collection, &callback) {
                Ok(subscriptions) => {
                    info!(
                        collection = %collection.name(),
                        partitions = subscriptions.len(),
                        "Watching collection"
                    );
                    self.subscriptions
                        .lock()
                        .insert(collection.name().to_string(), subscriptions);
                }
                Err(e) => {
                    error!(collection = %collection.name(), error = %e, "Failed to watch collection");
                }
            }
        }

        Ok(())
    }

    /// Detach every consumer. Durable positions are kept by the transport.
    pub fn stop(&self) {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .drain()
            .flat_map(|(_, subs)| subs)
            .collect();

        debug!(parent: &self.span, count = subscriptions.len(), "Detaching consumers");
        drop(subscriptions);
    }

    fn assert_stream(&self, collection: &Collection) -> Result<()> {
        let name = collection.stream_name();

        if self.transport.stream_info(&name)?.is_some() {
            return Ok(());
        }

        let config = StreamConfig {
            name: name.clone(),
            description: format!("Event store for {}", collection.name()),
            subjects: collection.stream_subjects(),
        };

        match self.transport.add_stream(config) {
            Ok(_) => {
                info!(stream = %name, "Created collection stream");
                Ok(())
            }
            // Created concurrently by someone else
            Err(SnapshotError::StreamExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Attach all partitions of one collection, or none of them.
    fn attach(&self, collection: &Arc<Collection>, callback: &WatchCallback) -> Result<Vec<Subscription>> {
        self.assert_stream(collection)?;

        let mut subscriptions = Vec::with_capacity(self.partitions.len());

        for &partition in &self.partitions {
            let config = ConsumerConfig::durable_new(
                collection.durable_name(partition),
                collection.partition_subject(partition),
            );

            let name = collection.name().to_string();
            let callback = Arc::clone(callback);
            let handler: MessageHandler = Arc::new(move |msg: &Message| callback(&name, partition, msg));

            // Dropping what was attached so far releases those consumers
            subscriptions.push(self.transport.subscribe(config, handler)?);
            debug!(collection = %collection.name(), partition, "Attached partition consumer");
        }

        Ok(subscriptions)
    }
}

impl Drop for CollectionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, RequestHandler, StreamInfo};
    use crate::types::Sequence;
    use std::time::{Duration, Instant};

    fn watcher(broker: &MemoryBroker, partitions: u64) -> CollectionWatcher {
        CollectionWatcher::new("gravity", Arc::new(broker.clone()), partitions, Span::none())
    }

    fn recorder() -> (WatchCallback, Arc<Mutex<Vec<(String, u64, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: WatchCallback = Arc::new(move |collection: &str, partition: u64, msg: &Message| {
            sink.lock()
                .push((collection.to_string(), partition, msg.subject.clone()));
            Ok(())
        });
        (callback, seen)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_register_is_idempotent() {
        let broker = MemoryBroker::new();
        let w = watcher(&broker, 2);

        let a = w.register_collection("users").unwrap();
        let b = w.register_collection("users").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(w.collection_names(), vec!["users"]);

        w.unregister_collection("users");
        w.unregister_collection("users");
        w.unregister_collection("never");
        assert!(w.collection("users").is_none());
        assert!(w.collection_names().is_empty());
    }

    #[test]
    fn test_register_rejects_invalid_names() {
        let broker = MemoryBroker::new();
        let w = watcher(&broker, 1);
        w.register_collection("a").unwrap();

        for bad in ["a.b", "*", ">", "", "a b"] {
            assert!(matches!(w.register_collection(bad), Err(SnapshotError::Config(_))));
        }
        assert_eq!(w.collection_names(), vec!["a"]);
    }

    #[test]
    fn test_watch_creates_streams_and_consumers() {
        let broker = MemoryBroker::new();
        let w = watcher(&broker, 3);
        w.register_collection("users").unwrap();
        w.register_collection("orders").unwrap();

        let (callback, _) = recorder();
        w.watch(callback).unwrap();

        assert!(broker.stream_info("gravity.COLLECTION.users").unwrap().is_some());
        assert!(broker.stream_info("gravity.COLLECTION.orders").unwrap().is_some());
        assert_eq!(broker.active_consumers(), 6);
        assert!(w.is_watching("users"));
    }

    #[test]
    fn test_existing_stream_is_reused() {
        let broker = MemoryBroker::new();
        broker
            .add_stream(StreamConfig {
                name: "gravity.COLLECTION.users".into(),
                description: String::new(),
                subjects: vec!["gravity.COLLECTION.users.>".into()],
            })
            .unwrap();

        let w = watcher(&broker, 1);
        w.register_collection("users").unwrap();
        let (callback, _) = recorder();
        w.watch(callback).unwrap();

        assert!(w.is_watching("users"));
    }

    /// Reports no stream, then loses the race to create it.
    struct LateStreamTransport {
        inner: MemoryBroker,
    }

    impl EventTransport for LateStreamTransport {
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        fn stream_info(&self, _name: &str) -> Result<Option<StreamInfo>> {
            Ok(None)
        }

        fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
            let name = config.name.clone();
            self.inner.add_stream(config)?;
            Err(SnapshotError::StreamExists(name))
        }

        fn publish(&self, subject: &str, data: Vec<u8>) -> Result<Sequence> {
            self.inner.publish(subject, data)
        }

        fn subscribe(&self, config: ConsumerConfig, handler: MessageHandler) -> Result<Subscription> {
            self.inner.subscribe(config, handler)
        }

        fn serve(&self, subject: &str, handler: RequestHandler) -> Result<Subscription> {
            self.inner.serve(subject, handler)
        }

        fn request(&self, subject: &str, data: Vec<u8>) -> Result<Vec<u8>> {
            self.inner.request(subject, data)
        }

        fn disconnect(&self) {
            self.inner.disconnect()
        }
    }

    #[test]
    fn test_stream_created_concurrently_is_tolerated() {
        let broker = MemoryBroker::new();
        let transport = Arc::new(LateStreamTransport { inner: broker.clone() });
        let w = CollectionWatcher::new("gravity", transport, 2, Span::none());
        w.register_collection("users").unwrap();

        let (callback, seen) = recorder();
        w.watch(callback).unwrap();

        assert!(w.is_watching("users"));
        assert_eq!(broker.active_consumers(), 2);

        broker
            .publish("gravity.COLLECTION.users.0.EVENT.userCreated", b"x".to_vec())
            .unwrap();
        assert!(wait_for(|| seen.lock().len() == 1));
    }

    #[test]
    fn test_deliveries_carry_collection_and_partition() {
        let broker = MemoryBroker::new();
        let w = watcher(&broker, 2);
        w.register_collection("users").unwrap();

        let (callback, seen) = recorder();
        w.watch(callback).unwrap();

        broker
            .publish("gravity.COLLECTION.users.1.EVENT.userCreated", b"x".to_vec())
            .unwrap();

        assert!(wait_for(|| seen.lock().len() == 1));
        assert_eq!(
            seen.lock()[0],
            (
                "users".to_string(),
                1,
                "gravity.COLLECTION.users.1.EVENT.userCreated".to_string()
            )
        );
    }

    #[test]
    fn test_watch_again_only_attaches_new_collections() {
        let broker = MemoryBroker::new();
        let w = watcher(&broker, 2);
        w.register_collection("users").unwrap();

        let (callback, _) = recorder();
        w.watch(callback.clone()).unwrap();
        w.watch(callback.clone()).unwrap();
        assert_eq!(broker.active_consumers(), 2);

        w.register_collection("orders").unwrap();
        w.watch(callback).unwrap();
        assert_eq!(broker.active_consumers(), 4);
    }

    #[test]
    fn test_failing_collection_is_skipped() {
        let broker = MemoryBroker::new();
        broker
            .add_stream(StreamConfig {
                name: "gravity.COLLECTION.users".into(),
                description: String::new(),
                subjects: vec!["gravity.COLLECTION.users.>".into()],
            })
            .unwrap();

        let w = watcher(&broker, 2);
        w.register_collection("users").unwrap();
        w.register_collection("orders").unwrap();

        // Hold the durable so attaching users fails on its first partition
        let (callback, _) = recorder();
        let handler: MessageHandler = Arc::new(|_: &Message| Ok(()));
        let _held = broker
            .subscribe(
                ConsumerConfig::durable_new("gravity-users-0-SNAPSHOT", "gravity.COLLECTION.users.0.EVENT.*"),
                handler,
            )
            .unwrap();

        w.watch(callback).unwrap();

        assert!(!w.is_watching("users"));
        assert!(w.is_watching("orders"));
        assert_eq!(broker.active_consumers(), 3);
    }

    #[test]
    fn test_unregister_keeps_consumers() {
        let broker = MemoryBroker::new();
        let w = watcher(&broker, 2);
        w.register_collection("users").unwrap();

        let (callback, _) = recorder();
        w.watch(callback).unwrap();
        w.unregister_collection("users");

        assert!(w.is_watching("users"));
        assert_eq!(broker.active_consumers(), 2);

        w.stop();
        assert_eq!(broker.active_consumers(), 0);
    }

    #[test]
    fn test_watch_requires_connection() {
        let broker = MemoryBroker::new();
        let w = watcher(&broker, 1);
        w.register_collection("users").unwrap();
        broker.disconnect();

        let (callback, _) = recorder();
        assert!(matches!(w.watch(callback), Err(SnapshotError::Disconnected)));
    }
}
