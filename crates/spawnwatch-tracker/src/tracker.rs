//! Alert pipeline.
//!
//! Each boss moves through `Idle -> PreArmed -> SpawnArmed -> AwaitingResponse
//! -> Idle`. Every event (a report, a user response, an expired timer)
//! recomputes the window, re-arms the timers and persists a snapshot.
//!
//! All mutation happens under one lock. Transport calls run with the lock
//! released, so each handler re-validates its timer token after delivery.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::estimate;
use crate::{
    Alert, AlertKind, Clock, Destination, Entity, EntityRef, EntityStore, GroupId, MessageRef,
    NewEntity, Phase, Response, SnapshotStore, TimerAction, TimerFired, TimerRegistry,
    TrackerError, Transport,
};

/// Alert timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How long before the window opens the pre-alert goes out.
    pub pre_lead: Duration,
    /// How long a spawn alert waits for an answer before counting as missed.
    pub response_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pre_lead: Duration::minutes(10),
            response_timeout: Duration::minutes(20),
        }
    }
}

pub(crate) struct State {
    pub(crate) store: EntityStore,
    pub(crate) timers: TimerRegistry,
}

/// Where an alert for one boss goes.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    primary: Option<Destination>,
    fallback: Option<Destination>,
}

impl Route {
    pub(crate) fn for_entity(entity: &Entity, channel: Option<&Destination>) -> Self {
        Self {
            primary: entity
                .notification_destination
                .clone()
                .or_else(|| channel.cloned()),
            fallback: entity.fallback_destination.clone(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.primary.is_none() && self.fallback.is_none()
    }
}

/// Tracks bosses and drives their alerts.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Tracker {
    pub(crate) state: Arc<Mutex<State>>,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn SnapshotStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: TrackerConfig,
}

impl Tracker {
    /// Create a tracker over an existing store and registry.
    pub fn new(
        store: EntityStore,
        timers: TimerRegistry,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(State { store, timers })),
            transport,
            persistence,
            clock,
            config,
        }
    }

    /// Restore state from `persistence` and build a tracker.
    ///
    /// Returns the receiver for expired timers, to be handed to [`run`](Self::run).
    /// No timers are armed until [`reconcile`](Self::reconcile) is called.
    pub async fn open(
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TimerFired>), TrackerError> {
        let store = match persistence.load().await? {
            Some(snapshot) => EntityStore::restore(snapshot)?,
            None => EntityStore::new(),
        };
        info!(count = store.len(), "loaded tracked bosses");

        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let timers = TimerRegistry::new(Arc::clone(&clock), fired_tx);
        let tracker = Self::new(store, timers, transport, persistence, clock, config);
        Ok((tracker, fired_rx))
    }

    // === Commands ===

    /// Start tracking a boss.
    #[tracing::instrument(skip(self, request), fields(name = %request.name))]
    pub async fn add_entity(
        &self,
        group: &GroupId,
        mut request: NewEntity,
    ) -> Result<EntityRef, TrackerError> {
        let mut state = self.state.lock().await;
        if request.destination.is_none() {
            request.destination = state.store.channel(group).cloned();
        }
        let entity = Entity::create(request, self.clock.now())?;
        let entity_ref = state.store.insert(group, entity)?;
        info!(entity = %entity_ref, "tracking boss");

        self.persist(&state).await;
        Ok(entity_ref)
    }

    /// Record a confirmed kill at `killed_at` and re-arm alerts.
    ///
    /// Resolves an outstanding spawn alert, if any.
    #[tracing::instrument(skip(self, entity_ref), fields(entity = %entity_ref))]
    pub async fn report_kill(
        &self,
        entity_ref: &EntityRef,
        killed_at: DateTime<Utc>,
    ) -> Result<Entity, TrackerError> {
        let now = self.clock.now();
        self.apply_report(entity_ref, |entity| {
            estimate::on_resolved(entity, killed_at, now)
        })
        .await
    }

    /// Record that the boss was missed at `at` and re-arm alerts.
    #[tracing::instrument(skip(self, entity_ref), fields(entity = %entity_ref))]
    pub async fn report_missed(
        &self,
        entity_ref: &EntityRef,
        at: DateTime<Utc>,
    ) -> Result<Entity, TrackerError> {
        let now = self.clock.now();
        self.apply_report(entity_ref, |entity| {
            if at > now {
                return Err(TrackerError::InvalidInput(format!(
                    "miss time {} is in the future",
                    at.to_rfc3339()
                )));
            }
            estimate::on_missed(entity, at)
        })
        .await
    }

    async fn apply_report<F>(&self, entity_ref: &EntityRef, compute: F) -> Result<Entity, TrackerError>
    where
        F: FnOnce(&Entity) -> Result<crate::Prediction, TrackerError>,
    {
        let mut guard = self.state.lock().await;
        let State { store, timers } = &mut *guard;
        let entity = store.require_mut(entity_ref)?;

        let prediction = compute(entity)?;
        let superseded = entity.pending_message.take();
        entity.apply(prediction);
        self.arm_phases(timers, entity_ref, entity);
        let updated = entity.clone();

        self.persist(&guard).await;
        drop(guard);

        if let Some(message) = superseded {
            self.strip(&message).await;
        }
        Ok(updated)
    }

    /// Stop tracking a boss, cancelling its timers first.
    #[tracing::instrument(skip(self, entity_ref), fields(entity = %entity_ref))]
    pub async fn remove_entity(&self, entity_ref: &EntityRef) -> Result<Entity, TrackerError> {
        let mut guard = self.state.lock().await;
        let State { store, timers } = &mut *guard;
        let entity = store.require_mut(entity_ref)?;
        timers.cancel_all(entity_ref, entity);
        let removed = store
            .remove(entity_ref)
            .ok_or_else(|| TrackerError::NotFound(entity_ref.clone()))?;
        info!("stopped tracking boss");

        self.persist(&guard).await;
        drop(guard);

        if let Some(message) = &removed.pending_message {
            self.strip(message).await;
        }
        Ok(removed)
    }

    /// Set the default alert destination of a group.
    #[tracing::instrument(skip(self))]
    pub async fn set_channel(&self, group: &GroupId, destination: Destination) {
        let mut state = self.state.lock().await;
        state.store.set_channel(group, destination);
        self.persist(&state).await;
    }

    /// Bosses of a group, soonest window first; unpredicted bosses last.
    pub async fn status(&self, group: &GroupId) -> Vec<Entity> {
        let state = self.state.lock().await;
        let mut bosses: Vec<Entity> = state.store.group(group).cloned().collect();
        bosses.sort_by(|a, b| {
            (a.next_window_start.is_none(), a.next_window_start, &a.name).cmp(&(
                b.next_window_start.is_none(),
                b.next_window_start,
                &b.name,
            ))
        });
        bosses
    }

    /// Current state of one boss.
    pub async fn entity(&self, entity_ref: &EntityRef) -> Option<Entity> {
        self.state.lock().await.store.get(entity_ref).cloned()
    }

    /// Armed phases of one boss with their fire times.
    pub async fn armed(&self, entity_ref: &EntityRef) -> Vec<(Phase, DateTime<Utc>)> {
        self.state.lock().await.timers.armed(entity_ref)
    }

    /// Current time on the tracker's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Handle a user's answer to a spawn alert.
    ///
    /// Returns `Ok(false)` when no spawn alert is pending, in which case the
    /// answer is stale and nothing changes.
    #[tracing::instrument(skip(self, entity_ref), fields(entity = %entity_ref))]
    pub async fn resolve(
        &self,
        entity_ref: &EntityRef,
        response: Response,
        responded_at: DateTime<Utc>,
    ) -> Result<bool, TrackerError> {
        let mut guard = self.state.lock().await;
        let State { store, timers } = &mut *guard;
        let entity = store.require_mut(entity_ref)?;

        if entity.pending_message.is_none() {
            debug!("no pending spawn alert, ignoring response");
            return Ok(false);
        }

        let prediction = match response {
            Response::ConfirmedKill => {
                estimate::on_resolved(entity, responded_at, self.clock.now())?
            }
            Response::Missed => estimate::on_missed(entity, responded_at)?,
            Response::NotAppeared => estimate::on_not_appeared(entity, responded_at)?,
        };

        timers.cancel(entity_ref, entity, Phase::AutoTimeout);
        let message = entity.pending_message.take();
        entity.apply(prediction);
        self.arm_phases(timers, entity_ref, entity);
        info!(?response, next_window_start = ?entity.next_window_start, "spawn alert resolved");

        self.persist(&guard).await;
        drop(guard);

        if let Some(message) = message {
            self.strip(&message).await;
        }
        Ok(true)
    }

    /// Re-arm the pre-alert and spawn-alert timers of a boss.
    pub async fn schedule_all(&self, entity_ref: &EntityRef) {
        let mut guard = self.state.lock().await;
        let State { store, timers } = &mut *guard;
        if let Some(entity) = store.get_mut(entity_ref) {
            self.arm_phases(timers, entity_ref, entity);
        }
    }

    // === Timers ===

    /// Dispatch expired timers until shutdown.
    ///
    /// Each event is handled on its own task so a slow delivery for one boss
    /// does not hold up the others.
    pub async fn run(
        &self,
        mut fired_rx: mpsc::UnboundedReceiver<TimerFired>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("alert dispatcher starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("alert dispatcher received shutdown signal");
                        break;
                    }
                }
                fired = fired_rx.recv() => {
                    let Some(fired) = fired else { break };
                    let tracker = self.clone();
                    tokio::spawn(async move {
                        tracker.handle_fired(fired).await;
                    });
                }
            }
        }

        info!("alert dispatcher stopped");
    }

    /// Handle one expired timer. Stale timers are dropped.
    #[tracing::instrument(skip(self, fired), fields(entity = %fired.entity, token = %fired.token))]
    pub async fn handle_fired(&self, fired: TimerFired) {
        match fired.action.clone() {
            TimerAction::PreAlert => self.fire_pre_alert(&fired).await,
            TimerAction::SpawnAlert => {
                self.fire_spawn_alert(&fired).await;
            }
            TimerAction::AutoTimeout { message } => self.fire_auto_timeout(&fired, message).await,
        }
    }

    async fn fire_pre_alert(&self, fired: &TimerFired) {
        let (alert, route) = {
            let mut guard = self.state.lock().await;
            let State { store, timers } = &mut *guard;
            let channel = store.channel(&fired.entity.group).cloned();
            let Some(entity) = store.get_mut(&fired.entity) else {
                debug!("boss no longer tracked, dropping pre-alert");
                return;
            };
            if !timers.consume(&fired.entity, entity, fired) {
                debug!("stale pre-alert timer");
                return;
            }
            (
                Alert::for_entity(AlertKind::PreAlert, &fired.entity, entity),
                Route::for_entity(entity, channel.as_ref()),
            )
        };

        if self.deliver(&fired.entity, &route, &alert).await.is_some() {
            info!("pre-alert sent");
        }
    }

    /// Send a spawn alert and arm its response timeout. Returns whether the
    /// alert was delivered and recorded as pending.
    pub(crate) async fn fire_spawn_alert(&self, fired: &TimerFired) -> bool {
        let (alert, route) = {
            let state = self.state.lock().await;
            let Some(entity) = state.store.get(&fired.entity) else {
                debug!("boss no longer tracked, dropping spawn alert");
                return false;
            };
            if !TimerRegistry::is_current(entity, Phase::SpawnAlert, fired.token) {
                debug!("stale spawn-alert timer");
                return false;
            }
            (
                Alert::for_entity(AlertKind::SpawnAlert, &fired.entity, entity),
                Route::for_entity(entity, state.store.channel(&fired.entity.group)),
            )
        };

        let delivered = self.deliver(&fired.entity, &route, &alert).await;

        let mut guard = self.state.lock().await;
        let State { store, timers } = &mut *guard;
        let current = match store.get_mut(&fired.entity) {
            Some(entity) => timers.consume(&fired.entity, entity, fired),
            None => false,
        };
        if !current {
            drop(guard);
            // Rescheduled or removed while the alert was in flight.
            if let Some(message) = delivered {
                debug!("spawn alert superseded during delivery");
                self.strip(&message).await;
            }
            return false;
        }
        let Some(entity) = store.get_mut(&fired.entity) else {
            return false;
        };

        let Some(message) = delivered else {
            warn!("spawn alert could not be delivered, boss left un-notified");
            return false;
        };

        let replaced = entity.pending_message.replace(message.clone());
        match self.clock.now().checked_add_signed(self.config.response_timeout) {
            Some(fire_at) => {
                timers.schedule(
                    &fired.entity,
                    entity,
                    TimerAction::AutoTimeout { message },
                    fire_at,
                );
                info!(timeout_at = %fire_at, "spawn alert sent, awaiting response");
            }
            None => warn!("response timeout out of range, spawn alert will not time out"),
        }

        self.persist(&guard).await;
        drop(guard);

        if let Some(old) = replaced {
            self.strip(&old).await;
        }
        true
    }

    async fn fire_auto_timeout(&self, fired: &TimerFired, message: MessageRef) {
        let mut guard = self.state.lock().await;
        let State { store, timers } = &mut *guard;
        let Some(entity) = store.get_mut(&fired.entity) else {
            debug!("boss no longer tracked, dropping auto-timeout");
            return;
        };
        if !timers.consume(&fired.entity, entity, fired) {
            debug!("stale auto-timeout timer");
            return;
        }
        if entity.pending_message.as_ref() != Some(&message) {
            debug!("pending spawn alert changed, dropping auto-timeout");
            return;
        }

        entity.pending_message = None;
        match estimate::on_auto_timeout(entity, self.clock.now()) {
            Ok(prediction) => {
                entity.apply(prediction);
                self.arm_phases(timers, &fired.entity, entity);
                info!(
                    next_window_start = ?entity.next_window_start,
                    "spawn alert unanswered, treating as missed"
                );
            }
            Err(e) => error!(error = %e, "spawn alert unanswered, could not re-estimate"),
        }

        self.persist(&guard).await;
        drop(guard);

        self.strip(&message).await;
    }

    // === Helpers ===

    /// Cancel every timer of `entity` and arm whichever of the pre-alert and
    /// spawn-alert phases still lie in the future.
    pub(crate) fn arm_phases(
        &self,
        timers: &mut TimerRegistry,
        entity_ref: &EntityRef,
        entity: &mut Entity,
    ) {
        let Some(start) = entity.next_window_start else {
            return;
        };
        timers.cancel_all(entity_ref, entity);
        if let Some(pre_alert_at) = start.checked_sub_signed(self.config.pre_lead) {
            timers.schedule(entity_ref, entity, TimerAction::PreAlert, pre_alert_at);
        }
        timers.schedule(entity_ref, entity, TimerAction::SpawnAlert, start);
    }

    /// Deliver to the primary destination, falling back once.
    async fn deliver(&self, entity_ref: &EntityRef, route: &Route, alert: &Alert) -> Option<MessageRef> {
        if let Some(primary) = &route.primary {
            match self.transport.deliver(primary, alert).await {
                Ok(message) => return Some(message),
                Err(e) => {
                    warn!(entity = %entity_ref, destination = %primary, error = %e, "delivery failed");
                }
            }
        }

        let fallback = route
            .fallback
            .as_ref()
            .filter(|fallback| route.primary.as_ref() != Some(*fallback));
        let Some(fallback) = fallback else {
            error!(entity = %entity_ref, kind = ?alert.kind, "no destination left to deliver alert");
            return None;
        };

        match self.transport.deliver(fallback, alert).await {
            Ok(message) => {
                info!(entity = %entity_ref, destination = %fallback, "delivered to fallback destination");
                Some(message)
            }
            Err(e) => {
                error!(entity = %entity_ref, destination = %fallback, error = %e, "fallback delivery failed");
                None
            }
        }
    }

    async fn strip(&self, message: &MessageRef) {
        if let Err(e) = self.transport.strip_response_options(message).await {
            warn!(message_id = %message.id, error = %e, "failed to strip response options");
        }
    }

    pub(crate) async fn persist(&self, state: &State) {
        let snapshot = state.store.snapshot(self.clock.now());
        if let Err(e) = self.persistence.save(&snapshot).await {
            error!(error = %e, "failed to persist snapshot");
        }
    }
}
