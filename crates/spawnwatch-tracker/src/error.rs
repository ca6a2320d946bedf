//! Error types for the tracker.

use thiserror::Error;

use crate::types::{Destination, EntityRef};

/// Errors returned by tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The request was rejected and nothing was changed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An entity with the same key already exists in the group.
    #[error("boss already tracked: {0}")]
    AlreadyExists(EntityRef),

    /// No entity with this key exists in the group.
    #[error("boss not found: {0}")]
    NotFound(EntityRef),

    /// Snapshot could not be loaded.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Errors from the snapshot store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Snapshot was written by an incompatible version.
    #[error("unsupported snapshot version: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u32, got: u32 },

    /// Write rejected by the backing store.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// Errors from the notification transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Destination does not exist or cannot be reached.
    #[error("destination unreachable: {0}")]
    Unreachable(Destination),

    /// Missing permission to post to the destination.
    #[error("permission denied for destination: {0}")]
    PermissionDenied(Destination),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}
