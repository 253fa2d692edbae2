//! Merge engine.
//!
//! Every delivered change is applied to the stored record of its key:
//! deletes remove the key, inserts and updates are folded into the existing
//! payload with [`apply_changes`]. Applying the same change twice yields the
//! same record, so redelivered messages are harmless.

mod changes;
mod handler;

pub use changes::apply_changes;
pub use handler::{RecordMerger, SnapshotHandler};
