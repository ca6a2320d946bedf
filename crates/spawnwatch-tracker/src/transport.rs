//! Notification transport contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{DeliveryError, Destination, Entity, EntityRef, MessageRef};

/// Which alert is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Informational heads-up ahead of the window.
    PreAlert,
    /// The window has opened; asks for a response.
    SpawnAlert,
}

/// Structured alert content. Rendering is left to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub entity: EntityRef,
    pub name: String,
    pub location: String,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub is_window: bool,
    /// Offer the confirmed-kill / missed / not-appeared choices.
    pub response_options: bool,
}

impl Alert {
    pub fn for_entity(kind: AlertKind, entity_ref: &EntityRef, entity: &Entity) -> Self {
        Self {
            kind,
            entity: entity_ref.clone(),
            name: entity.name.clone(),
            location: entity.location.clone(),
            window_start: entity.next_window_start,
            window_end: entity.next_window_end,
            is_window: entity.is_window,
            response_options: kind == AlertKind::SpawnAlert,
        }
    }
}

/// Delivers alerts to destinations.
///
/// User answers to a spawn alert come back through
/// [`Tracker::resolve`](crate::Tracker::resolve).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `alert` to `destination`, returning a handle to the message.
    async fn deliver(
        &self,
        destination: &Destination,
        alert: &Alert,
    ) -> Result<MessageRef, DeliveryError>;

    /// Remove the response choices from a delivered message.
    async fn strip_response_options(&self, message: &MessageRef) -> Result<(), DeliveryError>;
}
