//! Error types for the snapshot engine.

use thiserror::Error;

/// Main error type for snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Stream already exists: {0}")]
    StreamExists(String),

    #[error("Subjects overlap with stream: {0}")]
    SubjectsOverlap(String),

    #[error("No stream matches subject: {0}")]
    NoStreamForSubject(String),

    #[error("Consumer already bound: {0}")]
    ConsumerBound(String),

    #[error("No responder for subject: {0}")]
    NoResponder(String),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("View not found: {0}")]
    ViewNotFound(String),

    #[error("Snapshot workers are shut down")]
    WorkersStopped,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SnapshotError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SnapshotError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SnapshotError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SnapshotError::Deserialization(e.to_string())
    }
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;
