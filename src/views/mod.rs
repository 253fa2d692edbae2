//! Snapshot views.
//!
//! A view is a subscriber's cursor over one collection's snapshot table.
//! Pulling a view publishes a batch of stored records, in key order, to the
//! view's own stream, from which the subscriber reads them.

use crate::error::{Result, SnapshotError};
use crate::store::SnapshotStore;
use crate::transport::{EventTransport, StreamConfig};
use crate::types::{Meta, SnapshotRecord};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::{debug, info, warn, Span};
use uuid::Uuid;

/// A registered view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    pub id: String,
    pub subscriber: String,
    pub collection: String,
    pub created_at: DateTime<Utc>,
}

/// A record as published to a view stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulledRecord {
    /// Base64 of the stored key.
    pub key: String,
    pub payload: serde_json::Value,
    pub meta: Meta,
}

impl PulledRecord {
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.key)
            .map_err(|e| SnapshotError::Deserialization(e.to_string()))
    }
}

/// Registry of views plus the pull operation.
pub struct ViewManager {
    domain: String,
    store: Arc<dyn SnapshotStore>,
    transport: Arc<dyn EventTransport>,
    pull_batch_size: usize,
    views: RwLock<HashMap<String, View>>,
    span: Span,
}

impl ViewManager {
    pub fn new(
        domain: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
        transport: Arc<dyn EventTransport>,
        pull_batch_size: usize,
        span: Span,
    ) -> Self {
        Self {
            domain: domain.into(),
            store,
            transport,
            pull_batch_size: pull_batch_size.max(1),
            views: RwLock::new(HashMap::new()),
            span,
        }
    }

    /// `<domain>.SNAPSHOT.VIEW.<id>`
    pub fn view_stream(&self, id: &str) -> String {
        format!("{}.SNAPSHOT.VIEW.{}", self.domain, id)
    }

    pub fn create_view(&self, subscriber: &str, collection: &str) -> View {
        let view = View {
            id: Uuid::new_v4().to_string(),
            subscriber: subscriber.to_string(),
            collection: collection.to_string(),
            created_at: Utc::now(),
        };

        self.views.write().insert(view.id.clone(), view.clone());
        info!(parent: &self.span, id = %view.id, subscriber, collection, "Created view");

        view
    }

    /// Remove a view. Unknown ids are ignored.
    pub fn delete_view(&self, id: &str) {
        if self.views.write().remove(id).is_some() {
            info!(parent: &self.span, id, "Deleted view");
        }
    }

    pub fn get_view(&self, id: &str) -> Option<View> {
        self.views.read().get(id).cloned()
    }

    pub fn view_count(&self) -> usize {
        self.views.read().len()
    }

    /// Publish the next batch of a view's records to its stream.
    ///
    /// Starts at `last_key` (all keys when empty), skipping `last_key` itself
    /// when `after_last_key` is set. Returns the number of records published.
    pub fn pull(&self, id: &str, last_key: &[u8], after_last_key: bool) -> Result<usize> {
        let _enter = self.span.enter();

        let view = self
            .get_view(id)
            .ok_or_else(|| SnapshotError::ViewNotFound(id.to_string()))?;

        let stream = self.assert_view_stream(&view.id)?;

        let from = match (last_key.is_empty(), after_last_key) {
            (true, _) => Bound::Unbounded,
            (false, true) => Bound::Excluded(last_key),
            (false, false) => Bound::Included(last_key),
        };

        // Unreadable rows are skipped without counting against the batch
        let mut count = 0;
        let mut skipped = 0;
        let mut cursor: Option<Vec<u8>> = None;

        while count < self.pull_batch_size {
            let bound = match &cursor {
                Some(key) => Bound::Excluded(key.as_slice()),
                None => from,
            };
            let wanted = self.pull_batch_size - count;
            let entries = self.store.scan(&view.collection, bound, wanted)?;
            let exhausted = entries.len() < wanted;

            for (key, value) in entries {
                match SnapshotRecord::decode(&value) {
                    Ok(record) => {
                        let pulled = PulledRecord {
                            key: STANDARD.encode(&key),
                            payload: record.payload_json(),
                            meta: record.meta,
                        };
                        self.transport.publish(&stream, serde_json::to_vec(&pulled)?)?;
                        count += 1;
                    }
                    Err(e) => {
                        warn!(view = %view.id, error = %e, "Skipping unreadable record");
                        skipped += 1;
                    }
                }
                cursor = Some(key);
            }

            if exhausted {
                break;
            }
        }

        debug!(view = %view.id, collection = %view.collection, count, skipped, "Pulled view");
        Ok(count)
    }

    fn assert_view_stream(&self, id: &str) -> Result<String> {
        let name = self.view_stream(id);

        if self.transport.stream_info(&name)?.is_some() {
            return Ok(name);
        }

        let config = StreamConfig {
            name: name.clone(),
            description: format!("Snapshot view {}", id),
            subjects: vec![name.clone()],
        };

        match self.transport.add_stream(config) {
            Ok(_) | Err(SnapshotError::StreamExists(_)) => Ok(name),
            Err(e) => Err(e),
        }
    }
}
