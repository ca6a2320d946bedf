//! Per-entity phase timers.
//!
//! Every scheduling call issues a fresh [`TimerToken`] and records it on the
//! entity. When a timer expires it posts a [`TimerFired`] carrying the token it
//! was armed with; the handler compares that against the entity's live token
//! and drops the event when they differ.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::{Clock, Entity, EntityRef, MessageRef, Phase, TimerToken};

/// What to do when a timer expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    PreAlert,
    SpawnAlert,
    /// Resolve the spawn alert `message` as unattended.
    AutoTimeout { message: MessageRef },
}

impl TimerAction {
    pub fn phase(&self) -> Phase {
        match self {
            TimerAction::PreAlert => Phase::PreAlert,
            TimerAction::SpawnAlert => Phase::SpawnAlert,
            TimerAction::AutoTimeout { .. } => Phase::AutoTimeout,
        }
    }
}

/// Posted by an expired timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub entity: EntityRef,
    pub token: TimerToken,
    pub action: TimerAction,
}

struct ArmedTimer {
    token: TimerToken,
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Registry of armed timers keyed by (entity, phase).
pub struct TimerRegistry {
    clock: Arc<dyn Clock>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<(EntityRef, Phase), ArmedTimer>,
    next_token: u64,
}

impl TimerRegistry {
    /// Create a registry whose expired timers are posted to `fired_tx`.
    pub fn new(clock: Arc<dyn Clock>, fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            clock,
            fired_tx,
            armed: HashMap::new(),
            next_token: 1,
        }
    }

    /// Arm `action` for `entity` at `fire_at`, replacing any timer already
    /// armed for the same phase.
    ///
    /// Returns `None` without arming when `fire_at` is not in the future; the
    /// previous timer for the phase is cancelled either way. Must be called
    /// from within a tokio runtime.
    pub fn schedule(
        &mut self,
        entity_ref: &EntityRef,
        entity: &mut Entity,
        action: TimerAction,
        fire_at: DateTime<Utc>,
    ) -> Option<TimerToken> {
        let phase = action.phase();
        self.cancel(entity_ref, entity, phase);

        let now = self.clock.now();
        if fire_at <= now {
            debug!(entity = %entity_ref, %phase, %fire_at, "fire time already passed, not arming");
            return None;
        }

        let token = self.issue();

        let delay = (fire_at - now).to_std().unwrap_or_default();
        let fired = TimerFired {
            entity: entity_ref.clone(),
            token,
            action,
        };
        let tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            // Receiver gone means the tracker is shutting down.
            let _ = tx.send(fired);
        });

        *entity.timers.slot_mut(phase) = Some(token);
        self.armed.insert(
            (entity_ref.clone(), phase),
            ArmedTimer {
                token,
                fire_at,
                handle,
            },
        );
        debug!(entity = %entity_ref, %phase, %token, %fire_at, "armed timer");
        Some(token)
    }

    /// Issue a token for a phase that fires right away, without arming a
    /// timer. The caller handles the phase itself with this token.
    pub fn claim(&mut self, entity_ref: &EntityRef, entity: &mut Entity, phase: Phase) -> TimerToken {
        self.cancel(entity_ref, entity, phase);
        let token = self.issue();
        *entity.timers.slot_mut(phase) = Some(token);
        token
    }

    fn issue(&mut self) -> TimerToken {
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        token
    }

    /// Cancel the timer of one phase. No-op when none is armed.
    pub fn cancel(&mut self, entity_ref: &EntityRef, entity: &mut Entity, phase: Phase) {
        *entity.timers.slot_mut(phase) = None;
        if let Some(timer) = self.armed.remove(&(entity_ref.clone(), phase)) {
            timer.handle.abort();
            debug!(entity = %entity_ref, %phase, token = %timer.token, "cancelled timer");
        }
    }

    /// Cancel every phase timer of an entity. Idempotent.
    pub fn cancel_all(&mut self, entity_ref: &EntityRef, entity: &mut Entity) {
        for phase in Phase::ALL {
            self.cancel(entity_ref, entity, phase);
        }
    }

    /// Whether `token` is still the live token for `phase` on `entity`.
    pub fn is_current(entity: &Entity, phase: Phase, token: TimerToken) -> bool {
        entity.timers.get(phase) == Some(token)
    }

    /// Mark a fired timer as consumed, clearing the entity's slot.
    ///
    /// Returns false (and changes nothing) when the token is stale.
    pub fn consume(&mut self, entity_ref: &EntityRef, entity: &mut Entity, fired: &TimerFired) -> bool {
        let phase = fired.action.phase();
        if !Self::is_current(entity, phase, fired.token) {
            return false;
        }
        *entity.timers.slot_mut(phase) = None;
        self.armed.remove(&(entity_ref.clone(), phase));
        true
    }

    /// Phases currently armed for an entity, with their fire times.
    pub fn armed(&self, entity_ref: &EntityRef) -> Vec<(Phase, DateTime<Utc>)> {
        Phase::ALL
            .into_iter()
            .filter_map(|phase| {
                self.armed
                    .get(&(entity_ref.clone(), phase))
                    .map(|t| (phase, t.fire_at))
            })
            .collect()
    }

    /// Total number of armed timers.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        for timer in self.armed.values() {
            timer.handle.abort();
        }
    }
}
