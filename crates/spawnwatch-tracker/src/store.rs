//! Entity storage and snapshot persistence.
//!
//! The in-memory [`EntityStore`] is authoritative. Persistence is a whole-state
//! overwrite through a [`SnapshotStore`]; a failed write leaves memory as is.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{Destination, Entity, EntityKey, EntityRef, GroupId, PersistenceError, TrackerError};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted tracker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// group -> boss key -> boss.
    pub groups: BTreeMap<GroupId, BTreeMap<EntityKey, Entity>>,
    /// Default alert destination per group.
    #[serde(default)]
    pub channels: BTreeMap<GroupId, Destination>,
}

/// All tracked bosses, by group.
#[derive(Debug, Default)]
pub struct EntityStore {
    groups: BTreeMap<GroupId, BTreeMap<EntityKey, Entity>>,
    channels: BTreeMap<GroupId, Destination>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot. Timer tokens start empty.
    pub fn restore(snapshot: Snapshot) -> Result<Self, PersistenceError> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                expected: SNAPSHOT_VERSION,
                got: snapshot.version,
            });
        }
        let mut groups = snapshot.groups;
        for entity in groups.values_mut().flat_map(|g| g.values_mut()) {
            entity.timers = Default::default();
        }
        Ok(Self {
            groups,
            channels: snapshot.channels,
        })
    }

    /// Capture the full state for persistence.
    pub fn snapshot(&self, saved_at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at,
            groups: self.groups.clone(),
            channels: self.channels.clone(),
        }
    }

    /// Insert a new entity, failing on key collision.
    pub fn insert(&mut self, group: &GroupId, entity: Entity) -> Result<EntityRef, TrackerError> {
        let entity_ref = EntityRef::new(group.clone(), entity.key.clone());
        let bosses = self.groups.entry(group.clone()).or_default();
        if bosses.contains_key(&entity.key) {
            return Err(TrackerError::AlreadyExists(entity_ref));
        }
        bosses.insert(entity.key.clone(), entity);
        Ok(entity_ref)
    }

    pub fn get(&self, entity_ref: &EntityRef) -> Option<&Entity> {
        self.groups.get(&entity_ref.group)?.get(&entity_ref.key)
    }

    pub fn get_mut(&mut self, entity_ref: &EntityRef) -> Option<&mut Entity> {
        self.groups.get_mut(&entity_ref.group)?.get_mut(&entity_ref.key)
    }

    /// Like [`get_mut`](Self::get_mut) but with a `NotFound` error.
    pub fn require_mut(&mut self, entity_ref: &EntityRef) -> Result<&mut Entity, TrackerError> {
        self.get_mut(entity_ref)
            .ok_or_else(|| TrackerError::NotFound(entity_ref.clone()))
    }

    pub fn remove(&mut self, entity_ref: &EntityRef) -> Option<Entity> {
        let bosses = self.groups.get_mut(&entity_ref.group)?;
        let removed = bosses.remove(&entity_ref.key);
        if bosses.is_empty() {
            self.groups.remove(&entity_ref.group);
        }
        removed
    }

    /// Bosses of one group, in key order.
    pub fn group(&self, group: &GroupId) -> impl Iterator<Item = &Entity> {
        self.groups.get(group).into_iter().flat_map(|g| g.values())
    }

    /// Addresses of every tracked boss.
    pub fn refs(&self) -> Vec<EntityRef> {
        self.groups
            .iter()
            .flat_map(|(group, bosses)| {
                bosses
                    .keys()
                    .map(move |key| EntityRef::new(group.clone(), key.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self, group: &GroupId) -> Option<&Destination> {
        self.channels.get(group)
    }

    /// Set the group's default destination, applying it to every boss in the
    /// group that has no destination of its own.
    ///
    /// A boss that was using the previous default follows the new one.
    pub fn set_channel(&mut self, group: &GroupId, destination: Destination) {
        let previous = self.channels.insert(group.clone(), destination.clone());
        if let Some(bosses) = self.groups.get_mut(group) {
            for entity in bosses.values_mut() {
                let follows_default = match &entity.notification_destination {
                    None => true,
                    Some(current) => previous.as_ref() == Some(current),
                };
                if follows_default {
                    entity.notification_destination = Some(destination.clone());
                }
            }
        }
    }
}

/// Backing store for snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last snapshot; `None` on first run.
    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;
}

/// Snapshot stored as a JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)?;

        // Write to temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

/// In-process snapshot store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
    fail_writes: Mutex<bool>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing snapshot, as after a restart.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Make subsequent saves fail.
    pub fn set_fail_writes(&self, fail: bool) {
        *lock(&self.fail_writes) = fail;
    }

    /// Last successfully saved snapshot.
    pub fn current(&self) -> Option<Snapshot> {
        lock(&self.snapshot).clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        *lock(&self.saves)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        Ok(self.current())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        if *lock(&self.fail_writes) {
            return Err(PersistenceError::WriteFailed("memory store write disabled".to_string()));
        }
        *lock(&self.snapshot) = Some(snapshot.clone());
        *lock(&self.saves) += 1;
        Ok(())
    }
}
