//! Per-event decision: delete, insert, or merge into the stored record.

use super::changes::apply_changes;
use crate::error::Result;
use crate::store::SnapshotStore;
use crate::types::{ChangeEvent, Meta, Method, SnapshotRecord, Value};
use std::sync::Arc;
use tracing::{debug, warn, Span};

/// Merge callback state: the metadata of the event being applied.
///
/// [`RecordMerger::merge`] is a pure function of its inputs and the captured
/// meta, so the store may call it any number of times.
#[derive(Clone, Debug)]
pub struct RecordMerger {
    meta: Meta,
}

impl RecordMerger {
    pub fn new(meta: Meta) -> Self {
        Self { meta }
    }

    /// Combine the stored bytes with incoming bytes.
    ///
    /// Returns `origin` unchanged if either side fails to decode or the
    /// result fails to encode.
    pub fn merge(&self, origin: &[u8], incoming: &[u8]) -> Vec<u8> {
        let mut merged = match SnapshotRecord::decode(origin) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Stored record is unreadable, keeping it");
                return origin.to_vec();
            }
        };

        let incoming = match SnapshotRecord::decode(incoming) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Incoming record is unreadable, keeping stored one");
                return origin.to_vec();
            }
        };

        for (k, v) in &self.meta {
            merged.meta.insert(k.clone(), v.clone());
        }

        let payload = merged.payload.get_or_insert_with(Value::empty_map);
        if let Some(changes) = &incoming.payload {
            apply_changes(payload, changes);
        }

        match merged.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Merged record failed to encode, keeping stored one");
                origin.to_vec()
            }
        }
    }
}

/// Applies change events to a [`SnapshotStore`].
pub struct SnapshotHandler {
    store: Arc<dyn SnapshotStore>,
    span: Span,
}

impl SnapshotHandler {
    pub fn new(store: Arc<dyn SnapshotStore>, span: Span) -> Self {
        Self { store, span }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Apply one encoded [`ChangeEvent`].
    ///
    /// Undecodable events and events without a usable primary key are
    /// dropped with a warning and reported as handled. Store errors are
    /// returned so the caller can retry the delivery.
    pub fn handle(&self, meta: &Meta, data: &[u8]) -> Result<()> {
        let _enter = self.span.enter();

        let event = match ChangeEvent::decode(data) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, size = data.len(), "Dropping undecodable event");
                return Ok(());
            }
        };

        let key = match event.primary_key_bytes() {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(table = %event.table, event = %event.event_name, "Dropping event without primary key");
                return Ok(());
            }
            Err(e) => {
                warn!(table = %event.table, error = %e, "Dropping event with unusable primary key");
                return Ok(());
            }
        };

        if event.method == Method::Delete {
            return self.store.delete(&event.table, &key);
        }

        let record = SnapshotRecord::new(event.payload.clone()).with_meta(meta.clone());
        let encoded = match record.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(table = %event.table, error = %e, "Dropping event whose record failed to encode");
                return Ok(());
            }
        };

        let merger = RecordMerger::new(meta.clone());
        let merge = |origin: &[u8], incoming: &[u8]| merger.merge(origin, incoming);

        self.store.upsert(&event.table, &key, encoded, &merge)
    }
}
