//! In-process stream broker.

use super::subject;
use super::{
    AckPolicy, ConsumerConfig, DeliverPolicy, EventTransport, Message, MessageHandler,
    MessageMetadata, RequestHandler, StreamConfig, StreamInfo, Subscription,
};
use crate::error::{Result, SnapshotError};
use crate::types::Sequence;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// How long an idle consumer waits before re-checking its stream.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
struct StoredMessage {
    sequence: Sequence,
    subject: String,
    data: Vec<u8>,
}

struct Stream {
    config: StreamConfig,
    /// Messages in sequence order; `messages[i].sequence == i + 1`.
    messages: Vec<StoredMessage>,
}

impl Stream {
    fn last_sequence(&self) -> Sequence {
        Sequence(self.messages.len() as u64)
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.messages.len() as u64,
            last_sequence: self.last_sequence(),
        }
    }

    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject::matches(pattern, subject))
    }

    /// First message after `floor` whose subject matches `filter`.
    fn next_after(&self, floor: Sequence, filter: &str) -> Option<StoredMessage> {
        let start = (floor.0 as usize).min(self.messages.len());
        self.messages[start..]
            .iter()
            .find(|m| subject::matches(filter, &m.subject))
            .cloned()
    }
}

/// Persistent position of a durable consumer.
struct DurableState {
    filter_subject: String,
    ack_floor: Sequence,
    consumer_sequence: u64,
    bound: bool,
}

struct ActiveConsumer {
    stop: Arc<AtomicBool>,
    notify: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct BrokerInner {
    disconnected: AtomicBool,
    streams: RwLock<HashMap<String, Stream>>,
    /// Keyed by `<stream>/<durable name>`.
    durables: Mutex<HashMap<String, DurableState>>,
    active: Mutex<HashMap<u64, ActiveConsumer>>,
    responders: RwLock<HashMap<u64, (String, RequestHandler)>>,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn ensure_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(SnapshotError::Disconnected);
        }
        Ok(())
    }

    fn next_message(&self, stream: &str, floor: Sequence, filter: &str) -> Option<StoredMessage> {
        self.streams
            .read()
            .get(stream)
            .and_then(|s| s.next_after(floor, filter))
    }

    fn ack(&self, durable_key: &str, floor: Sequence, consumer_sequence: u64) {
        if let Some(state) = self.durables.lock().get_mut(durable_key) {
            state.ack_floor = state.ack_floor.max(floor);
            state.consumer_sequence = consumer_sequence;
        }
    }

    fn release_durable(&self, durable_key: &str) {
        if let Some(state) = self.durables.lock().get_mut(durable_key) {
            state.bound = false;
        }
    }

    fn wake_consumers(&self) {
        for consumer in self.active.lock().values() {
            let _ = consumer.notify.try_send(());
        }
    }

    fn stop_consumer(&self, id: u64) {
        let consumer = self.active.lock().remove(&id);
        if let Some(consumer) = consumer {
            Self::stop_and_join(consumer);
        }
    }

    fn stop_and_join(mut consumer: ActiveConsumer) {
        consumer.stop.store(true, Ordering::SeqCst);
        let _ = consumer.notify.try_send(());

        if let Some(handle) = consumer.handle.take() {
            // A handler may drop its own subscription
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// State owned by one consumer thread.
struct ConsumerTask {
    broker: Weak<BrokerInner>,
    stream: String,
    durable_key: Option<String>,
    config: ConsumerConfig,
    handler: MessageHandler,
    stop: Arc<AtomicBool>,
    notify: Receiver<()>,
    floor: Sequence,
    consumer_sequence: u64,
}

impl ConsumerTask {
    fn run(mut self) {
        let mut attempts = 0u64;
        let mut pending: Option<Sequence> = None;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let broker = match self.broker.upgrade() {
                Some(b) => b,
                None => break,
            };
            if broker.disconnected.load(Ordering::SeqCst) {
                break;
            }

            let stored = match broker.next_message(&self.stream, self.floor, &self.config.filter_subject) {
                Some(m) => m,
                None => {
                    drop(broker);
                    let _ = self.notify.recv_timeout(IDLE_POLL);
                    continue;
                }
            };

            if pending != Some(stored.sequence) {
                pending = Some(stored.sequence);
                attempts = 0;
            }
            attempts += 1;
            self.consumer_sequence += 1;

            let message = Message {
                subject: stored.subject,
                data: stored.data,
                metadata: Some(MessageMetadata {
                    stream: self.stream.clone(),
                    stream_sequence: stored.sequence,
                    consumer_sequence: Sequence(self.consumer_sequence),
                    delivered: attempts,
                }),
            };

            let result = (self.handler)(&message);

            match (result, self.config.ack_policy) {
                (Err(e), AckPolicy::All) => {
                    warn!(
                        stream = %self.stream,
                        sequence = stored.sequence.0,
                        delivered = attempts,
                        error = %e,
                        "Handler failed, message will be redelivered"
                    );
                    drop(broker);
                    thread::sleep(self.config.redelivery_delay);
                }
                (result, _) => {
                    if let Err(e) = result {
                        warn!(stream = %self.stream, error = %e, "Handler failed, message dropped");
                    }
                    self.floor = stored.sequence;
                    if let Some(key) = &self.durable_key {
                        broker.ack(key, self.floor, self.consumer_sequence);
                    }
                }
            }
        }

        if let (Some(key), Some(broker)) = (&self.durable_key, self.broker.upgrade()) {
            broker.release_durable(key);
        }
        debug!(stream = %self.stream, "Consumer stopped");
    }
}

/// In-process implementation of [`EventTransport`].
///
/// Clones share the same broker. Durable consumer positions survive
/// unsubscribe and [`MemoryBroker::reconnect`], which lets tests model a
/// process restart against the same stream.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-establish the connection after [`EventTransport::disconnect`].
    pub fn reconnect(&self) {
        self.inner.disconnected.store(false, Ordering::SeqCst);
    }

    /// All messages currently in a stream, in order.
    pub fn stream_messages(&self, stream: &str) -> Vec<Message> {
        self.inner
            .streams
            .read()
            .get(stream)
            .map(|s| {
                s.messages
                    .iter()
                    .map(|m| Message {
                        subject: m.subject.clone(),
                        data: m.data.clone(),
                        metadata: Some(MessageMetadata {
                            stream: stream.to_string(),
                            stream_sequence: m.sequence,
                            consumer_sequence: m.sequence,
                            delivered: 1,
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Acknowledged position of a durable consumer.
    pub fn durable_ack_floor(&self, stream: &str, durable_name: &str) -> Option<Sequence> {
        self.inner
            .durables
            .lock()
            .get(&format!("{}/{}", stream, durable_name))
            .map(|d| d.ack_floor)
    }

    /// Number of running consumers.
    pub fn active_consumers(&self) -> usize {
        self.inner.active.lock().len()
    }
}

impl EventTransport for MemoryBroker {
    fn is_connected(&self) -> bool {
        !self.inner.disconnected.load(Ordering::SeqCst)
    }

    fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>> {
        self.inner.ensure_connected()?;
        Ok(self.inner.streams.read().get(name).map(Stream::info))
    }

    fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        self.inner.ensure_connected()?;

        if config.name.is_empty() || config.subjects.iter().any(|s| !subject::is_valid(s)) {
            return Err(SnapshotError::InvalidOperation(format!(
                "invalid stream config: {:?}",
                config
            )));
        }

        let mut streams = self.inner.streams.write();
        if streams.contains_key(&config.name) {
            return Err(SnapshotError::StreamExists(config.name));
        }

        if let Some(other) = streams.values().find(|s| {
            s.config
                .subjects
                .iter()
                .any(|a| config.subjects.iter().any(|b| subject::overlaps(a, b)))
        }) {
            return Err(SnapshotError::SubjectsOverlap(other.config.name.clone()));
        }

        let stream = Stream {
            config,
            messages: Vec::new(),
        };
        let info = stream.info();
        streams.insert(info.config.name.clone(), stream);

        Ok(info)
    }

    fn publish(&self, subject: &str, data: Vec<u8>) -> Result<Sequence> {
        self.inner.ensure_connected()?;

        let sequence = {
            let mut streams = self.inner.streams.write();
            let stream = streams
                .values_mut()
                .find(|s| s.captures(subject))
                .ok_or_else(|| SnapshotError::NoStreamForSubject(subject.to_string()))?;

            let sequence = stream.last_sequence().next();
            stream.messages.push(StoredMessage {
                sequence,
                subject: subject.to_string(),
                data,
            });
            sequence
        };

        self.inner.wake_consumers();
        Ok(sequence)
    }

    fn subscribe(&self, config: ConsumerConfig, handler: MessageHandler) -> Result<Subscription> {
        self.inner.ensure_connected()?;

        if !subject::is_valid(&config.filter_subject) {
            return Err(SnapshotError::InvalidOperation(format!(
                "invalid filter subject: {}",
                config.filter_subject
            )));
        }

        let (stream, last_sequence) = self
            .inner
            .streams
            .read()
            .values()
            .find(|s| s.captures(&config.filter_subject))
            .map(|s| (s.config.name.clone(), s.last_sequence()))
            .ok_or_else(|| SnapshotError::NoStreamForSubject(config.filter_subject.clone()))?;

        let start = match config.deliver_policy {
            DeliverPolicy::All => Sequence(0),
            DeliverPolicy::New => last_sequence,
        };

        let (durable_key, floor, consumer_sequence) = match &config.durable_name {
            Some(name) => {
                let key = format!("{}/{}", stream, name);
                let mut durables = self.inner.durables.lock();
                let state = durables.entry(key.clone()).or_insert_with(|| DurableState {
                    filter_subject: config.filter_subject.clone(),
                    ack_floor: start,
                    consumer_sequence: 0,
                    bound: false,
                });

                if state.bound {
                    return Err(SnapshotError::ConsumerBound(name.clone()));
                }
                if state.filter_subject != config.filter_subject {
                    return Err(SnapshotError::InvalidOperation(format!(
                        "durable {} is bound to subject {}",
                        name, state.filter_subject
                    )));
                }
                state.bound = true;

                (Some(key), state.ack_floor, state.consumer_sequence)
            }
            None => (None, start, 0),
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let (notify_tx, notify_rx) = bounded(1);

        let task = ConsumerTask {
            broker: Arc::downgrade(&self.inner),
            stream,
            durable_key: durable_key.clone(),
            config: config.clone(),
            handler,
            stop: Arc::clone(&stop),
            notify: notify_rx,
            floor,
            consumer_sequence,
        };

        let spawned = thread::Builder::new()
            .name(format!("consumer-{}", id))
            .spawn(move || task.run());

        let handle = match spawned {
            Ok(h) => h,
            Err(e) => {
                if let Some(key) = &durable_key {
                    self.inner.release_durable(key);
                }
                return Err(e.into());
            }
        };

        self.inner.active.lock().insert(
            id,
            ActiveConsumer {
                stop,
                notify: notify_tx,
                handle: Some(handle),
            },
        );

        let broker = Arc::downgrade(&self.inner);
        Ok(Subscription::new(config.filter_subject, move || {
            if let Some(broker) = broker.upgrade() {
                broker.stop_consumer(id);
            }
        }))
    }

    fn serve(&self, subject: &str, handler: RequestHandler) -> Result<Subscription> {
        self.inner.ensure_connected()?;

        if !subject::is_valid(subject) {
            return Err(SnapshotError::InvalidOperation(format!(
                "invalid subject: {}",
                subject
            )));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .responders
            .write()
            .insert(id, (subject.to_string(), handler));

        let broker = Arc::downgrade(&self.inner);
        Ok(Subscription::new(subject, move || {
            if let Some(broker) = broker.upgrade() {
                broker.responders.write().remove(&id);
            }
        }))
    }

    fn request(&self, subject: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        self.inner.ensure_connected()?;

        let handler = self
            .inner
            .responders
            .read()
            .values()
            .find(|(pattern, _)| subject::matches(pattern, subject))
            .map(|(_, handler)| Arc::clone(handler))
            .ok_or_else(|| SnapshotError::NoResponder(subject.to_string()))?;

        Ok(handler(&Message {
            subject: subject.to_string(),
            data,
            metadata: None,
        }))
    }

    fn disconnect(&self) {
        self.inner.disconnected.store(true, Ordering::SeqCst);

        let consumers: Vec<ActiveConsumer> = self.inner.active.lock().drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            BrokerInner::stop_and_join(consumer);
        }

        self.inner.responders.write().clear();
    }
}
