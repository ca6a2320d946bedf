//! Shared fixtures for tracker integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::{Notify, mpsc};

use spawnwatch_tracker::{
    Alert, AlertKind, DeliveryError, Destination, EntityRef, GroupId, ManualClock, MemoryStore,
    MessageRef, NewEntity, Phase, TimerAction, TimerFired, Tracker, TrackerConfig, Transport,
};

/// A delivered alert.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: Destination,
    pub alert: Alert,
    pub message: MessageRef,
}

/// Holds deliveries until released.
#[derive(Default)]
pub struct DeliveryGate {
    /// Notified when a delivery reaches the gate.
    pub entered: Notify,
    /// Notify to let the held delivery complete.
    pub release: Notify,
}

/// Transport double that records every call.
#[derive(Default)]
pub struct RecordingTransport {
    deliveries: Mutex<Vec<Delivery>>,
    stripped: Mutex<Vec<MessageRef>>,
    failing: Mutex<HashSet<Destination>>,
    gate: Mutex<Option<Arc<DeliveryGate>>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make deliveries to `destination` fail.
    pub fn fail(&self, destination: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert(Destination::new(destination));
    }

    /// Block subsequent deliveries at the returned gate.
    pub fn hold_deliveries(&self) -> Arc<DeliveryGate> {
        let gate = Arc::new(DeliveryGate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn deliveries_of(&self, kind: AlertKind) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.alert.kind == kind)
            .collect()
    }

    pub fn stripped(&self) -> Vec<MessageRef> {
        self.stripped.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(
        &self,
        destination: &Destination,
        alert: &Alert,
    ) -> Result<MessageRef, DeliveryError> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        if self.failing.lock().unwrap().contains(destination) {
            return Err(DeliveryError::Unreachable(destination.clone()));
        }
        let mut deliveries = self.deliveries.lock().unwrap();
        let message = MessageRef {
            destination: destination.clone(),
            id: format!("msg-{}", deliveries.len() + 1),
        };
        deliveries.push(Delivery {
            destination: destination.clone(),
            alert: alert.clone(),
            message: message.clone(),
        });
        Ok(message)
    }

    async fn strip_response_options(&self, message: &MessageRef) -> Result<(), DeliveryError> {
        self.stripped.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub struct Harness {
    pub tracker: Tracker,
    pub fired_rx: mpsc::UnboundedReceiver<TimerFired>,
    pub transport: Arc<RecordingTransport>,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
    pub group: GroupId,
}

/// Fixed reference instant.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), t0()).await
    }

    /// Open a tracker over `store`, as a fresh process would.
    pub async fn with_store(store: Arc<MemoryStore>, now: DateTime<Utc>) -> Self {
        let clock = ManualClock::new(now);
        let transport = RecordingTransport::new();
        let (tracker, fired_rx) = Tracker::open(
            transport.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            TrackerConfig::default(),
        )
        .await
        .unwrap();
        Self {
            tracker,
            fired_rx,
            transport,
            store,
            clock,
            group: GroupId::new("guild-1"),
        }
    }

    pub async fn add(&self, name: &str, min_hours: i64, max_hours: Option<i64>) -> EntityRef {
        self.tracker
            .add_entity(&self.group, boss(name, min_hours, max_hours))
            .await
            .unwrap()
    }

    /// Fire the live timer of `phase` as if it had expired.
    pub async fn fire(&self, entity_ref: &EntityRef, phase: Phase) {
        let fired = self.live_timer(entity_ref, phase).await;
        self.tracker.handle_fired(fired).await;
    }

    /// Build the event the live timer of `phase` would post.
    pub async fn live_timer(&self, entity_ref: &EntityRef, phase: Phase) -> TimerFired {
        let entity = self.tracker.entity(entity_ref).await.unwrap();
        let token = entity
            .timers
            .get(phase)
            .unwrap_or_else(|| panic!("no live {phase} timer"));
        let action = match phase {
            Phase::PreAlert => TimerAction::PreAlert,
            Phase::SpawnAlert => TimerAction::SpawnAlert,
            Phase::AutoTimeout => TimerAction::AutoTimeout {
                message: entity.pending_message.expect("pending message"),
            },
        };
        TimerFired {
            entity: entity_ref.clone(),
            token,
            action,
        }
    }

    pub async fn armed_phases(&self, entity_ref: &EntityRef) -> Vec<Phase> {
        self.tracker
            .armed(entity_ref)
            .await
            .into_iter()
            .map(|(phase, _)| phase)
            .collect()
    }
}

pub fn boss(name: &str, min_hours: i64, max_hours: Option<i64>) -> NewEntity {
    NewEntity {
        name: name.to_string(),
        location: "Duskwood".to_string(),
        min_interval: Duration::hours(min_hours),
        max_interval: max_hours.map(Duration::hours),
        destination: Some(Destination::new("alerts")),
        fallback: Some(Destination::new("backup")),
    }
}
