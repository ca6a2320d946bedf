//! Respawn tracking for spawnwatch.
//!
//! This crate provides the scheduling core that:
//! - Predicts the next spawn window of each tracked boss
//! - Drives the pre-alert, spawn-alert and auto-timeout pipeline
//! - Persists state as whole-snapshot overwrites
//! - Reconciles live timers from a snapshot after a restart

mod clock;
mod error;
pub mod estimate;
mod reconcile;
mod store;
mod timers;
mod tracker;
mod transport;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DeliveryError, PersistenceError, TrackerError};
pub use reconcile::ReconcileReport;
pub use store::{EntityStore, JsonFileStore, MemoryStore, SNAPSHOT_VERSION, Snapshot, SnapshotStore};
pub use timers::{TimerAction, TimerFired, TimerRegistry};
pub use tracker::{Tracker, TrackerConfig};
pub use transport::{Alert, AlertKind, Transport};
pub use types::{
    Destination, Entity, EntityKey, EntityRef, GroupId, MAX_INTERVAL_HOURS, MessageRef,
    NewEntity, Phase, PhaseTokens, Prediction, Response, TimerToken,
};
