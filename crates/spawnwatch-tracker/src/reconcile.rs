//! Startup reconciliation.
//!
//! Timers live only in memory, so after a restart they are rebuilt from the
//! restored snapshot. A spawn alert already marked pending is never sent again;
//! its response timeout restarts from the moment it is rediscovered.

use tracing::{info, warn};

use crate::tracker::{Route, State};
use crate::{EntityRef, Phase, TimerAction, TimerFired, Tracker};

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Bosses whose upcoming alerts were re-armed.
    pub scheduled: usize,
    /// Pending spawn alerts given a fresh response timeout.
    pub timeouts_rearmed: usize,
    /// Bosses whose spawn alert came due while the process was down.
    pub overdue_alerted: usize,
    /// Bosses left without timers because they have nowhere to send alerts.
    pub unroutable: Vec<EntityRef>,
}

impl Tracker {
    /// Rebuild timers for every tracked boss. Call once at startup.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut overdue = Vec::new();

        {
            let mut guard = self.state.lock().await;
            let State { store, timers } = &mut *guard;
            let now = self.clock.now();

            for entity_ref in store.refs() {
                let channel = store.channel(&entity_ref.group).cloned();
                let Some(entity) = store.get_mut(&entity_ref) else {
                    continue;
                };

                if Route::for_entity(entity, channel.as_ref()).is_empty() {
                    warn!(entity = %entity_ref, "no destination configured, leaving boss unscheduled");
                    report.unroutable.push(entity_ref);
                    continue;
                }

                let upcoming = entity.next_window_start.filter(|start| *start > now);
                if upcoming.is_some() {
                    self.arm_phases(timers, &entity_ref, entity);
                    report.scheduled += 1;
                }

                match entity.pending_message.clone() {
                    Some(message) => {
                        let waiting = entity.timers.get(Phase::SpawnAlert).is_some()
                            || entity.timers.get(Phase::AutoTimeout).is_some();
                        let fire_at = now.checked_add_signed(self.config.response_timeout);
                        if let (false, Some(fire_at)) = (waiting, fire_at) {
                            timers.schedule(
                                &entity_ref,
                                entity,
                                TimerAction::AutoTimeout { message },
                                fire_at,
                            );
                            report.timeouts_rearmed += 1;
                        }
                    }
                    None => {
                        if entity.next_window_start.is_some()
                            && upcoming.is_none()
                            && entity.timers.is_idle()
                        {
                            let token = timers.claim(&entity_ref, entity, Phase::SpawnAlert);
                            overdue.push((entity_ref, token));
                        }
                    }
                }
            }
        }

        for (entity_ref, token) in overdue {
            let fired = TimerFired {
                entity: entity_ref,
                token,
                action: TimerAction::SpawnAlert,
            };
            if self.fire_spawn_alert(&fired).await {
                report.overdue_alerted += 1;
            }
        }

        info!(
            scheduled = report.scheduled,
            timeouts_rearmed = report.timeouts_rearmed,
            overdue_alerted = report.overdue_alerted,
            unroutable = report.unroutable.len(),
            "reconciled timers"
        );
        report
    }
}
