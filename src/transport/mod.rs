//! Stream transport boundary.
//!
//! The engine talks to its pub/sub stream system through [`EventTransport`]:
//! named streams bound to subject patterns, durable consumers with
//! cumulative acknowledgement, and request/reply for the view API.
//!
//! [`MemoryBroker`] is an in-process implementation with the same delivery
//! semantics: ordered delivery per consumer, acknowledgement after the
//! handler returns `Ok`, and redelivery of the unacknowledged message when it
//! returns an error.

mod memory;
pub mod subject;

pub use memory::MemoryBroker;

use crate::error::Result;
use crate::types::Sequence;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Stream definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub description: String,
    /// Subject patterns captured by the stream.
    pub subjects: Vec<String>,
}

/// Stream state as reported by the transport.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub messages: u64,
    pub last_sequence: Sequence,
}

/// Where a new consumer starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// From the first message in the stream.
    All,
    /// Only messages published after the consumer is created.
    New,
}

/// How deliveries are acknowledged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledging a message acknowledges every earlier one.
    All,
    /// No acknowledgement; failed deliveries are not retried.
    None,
}

/// Consumer definition.
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Durable name; `None` for an ephemeral consumer.
    pub durable_name: Option<String>,
    pub filter_subject: String,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    /// Pause before redelivering a message whose handler failed.
    pub redelivery_delay: Duration,
}

impl ConsumerConfig {
    /// Durable, cumulative-ack consumer that only sees new messages.
    pub fn durable_new(durable_name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            durable_name: Some(durable_name.into()),
            filter_subject: filter_subject.into(),
            deliver_policy: DeliverPolicy::New,
            ack_policy: AckPolicy::All,
            redelivery_delay: Duration::from_millis(100),
        }
    }

    /// Ephemeral consumer replaying the whole stream.
    pub fn ephemeral_all(filter_subject: impl Into<String>) -> Self {
        Self {
            durable_name: None,
            filter_subject: filter_subject.into(),
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::All,
            redelivery_delay: Duration::from_millis(100),
        }
    }
}

/// Delivery metadata of a stream message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMetadata {
    pub stream: String,
    /// Position in the stream; stable across redeliveries.
    pub stream_sequence: Sequence,
    /// Position in this consumer's delivery order; grows on redelivery.
    pub consumer_sequence: Sequence,
    /// Delivery attempt, starting at 1.
    pub delivered: u64,
}

/// A delivered message.
#[derive(Clone, Debug)]
pub struct Message {
    pub subject: String,
    pub data: Vec<u8>,
    /// Present for stream deliveries, absent for plain requests.
    pub metadata: Option<MessageMetadata>,
}

/// Handler for stream deliveries. Returning an error leaves the message
/// unacknowledged.
pub type MessageHandler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

/// Handler for requests; returns the reply body.
pub type RequestHandler = Arc<dyn Fn(&Message) -> Vec<u8> + Send + Sync>;

/// Handle to an active subscription. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            subject: subject.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stop receiving messages.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Pub/sub stream system used by the engine.
pub trait EventTransport: Send + Sync {
    /// Whether the transport is usable.
    fn is_connected(&self) -> bool;

    /// Look up a stream; `Ok(None)` if it does not exist.
    fn stream_info(&self, name: &str) -> Result<Option<StreamInfo>>;

    /// Create a stream. Fails with `StreamExists` if the name is taken.
    fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo>;

    /// Append a message to the stream capturing `subject`.
    fn publish(&self, subject: &str, data: Vec<u8>) -> Result<Sequence>;

    /// Attach a consumer; `handler` runs on a transport-owned thread, one
    /// message at a time.
    fn subscribe(&self, config: ConsumerConfig, handler: MessageHandler) -> Result<Subscription>;

    /// Answer requests sent to `subject` (wildcards allowed).
    fn serve(&self, subject: &str, handler: RequestHandler) -> Result<Subscription>;

    /// Send a request and wait for the reply.
    fn request(&self, subject: &str, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Drop the connection; every subscription stops.
    fn disconnect(&self);
}
