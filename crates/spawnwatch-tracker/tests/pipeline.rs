//! Alert pipeline tests: reports, timers, responses and auto-timeouts.

mod common;

use chrono::Duration;
use pretty_assertions::assert_eq;

use common::{Harness, t0};
use spawnwatch_tracker::{AlertKind, Destination, Phase, Response, TrackerError};

#[tokio::test]
async fn test_full_cycle_ends_in_auto_timeout() {
    let h = Harness::new().await;
    let kazzak = h.add("Lord Kazzak", 22, Some(26)).await;

    let entity = h.tracker.report_kill(&kazzak, t0()).await.unwrap();
    assert_eq!(entity.next_window_start, Some(t0() + Duration::hours(22)));
    assert_eq!(entity.next_window_end, Some(t0() + Duration::hours(26)));
    assert!(!entity.is_window);

    let armed = h.tracker.armed(&kazzak).await;
    assert_eq!(
        armed,
        vec![
            (Phase::PreAlert, t0() + Duration::hours(22) - Duration::minutes(10)),
            (Phase::SpawnAlert, t0() + Duration::hours(22)),
        ]
    );

    // Pre-alert at T0+21h50m
    h.clock.set(t0() + Duration::hours(21) + Duration::minutes(50));
    h.fire(&kazzak, Phase::PreAlert).await;
    let pre = h.transport.deliveries_of(AlertKind::PreAlert);
    assert_eq!(pre.len(), 1);
    assert!(!pre[0].alert.response_options);
    assert_eq!(pre[0].destination, Destination::new("alerts"));
    assert_eq!(h.armed_phases(&kazzak).await, vec![Phase::SpawnAlert]);

    // Spawn alert at T0+22h arms a 20 minute timeout
    h.clock.set(t0() + Duration::hours(22));
    h.fire(&kazzak, Phase::SpawnAlert).await;
    let spawn = h.transport.deliveries_of(AlertKind::SpawnAlert);
    assert_eq!(spawn.len(), 1);
    assert!(spawn[0].alert.response_options);

    let entity = h.tracker.entity(&kazzak).await.unwrap();
    assert_eq!(entity.pending_message, Some(spawn[0].message.clone()));
    assert_eq!(
        h.tracker.armed(&kazzak).await,
        vec![(
            Phase::AutoTimeout,
            t0() + Duration::hours(22) + Duration::minutes(20)
        )]
    );

    // Nobody answers
    let timeout_at = t0() + Duration::hours(22) + Duration::minutes(20);
    h.clock.set(timeout_at);
    h.fire(&kazzak, Phase::AutoTimeout).await;

    let entity = h.tracker.entity(&kazzak).await.unwrap();
    assert_eq!(entity.next_window_start, Some(timeout_at + Duration::hours(22)));
    assert_eq!(entity.next_window_end, Some(timeout_at + Duration::hours(26)));
    assert!(entity.is_window);
    assert!(entity.last_resolved_at.is_none());
    assert!(entity.pending_message.is_none());
    assert_eq!(h.transport.stripped(), vec![spawn[0].message.clone()]);
    assert_eq!(
        h.armed_phases(&kazzak).await,
        vec![Phase::PreAlert, Phase::SpawnAlert]
    );

    let saved = h.store.current().unwrap();
    let persisted = &saved.groups[&h.group][&kazzak.key];
    assert!(persisted.is_window);
    assert!(persisted.pending_message.is_none());
}

#[tokio::test]
async fn test_missed_response_without_max_interval() {
    let h = Harness::new().await;
    let boss = h.add("Azuregos", 22, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();

    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;

    let m = t0() + Duration::hours(22) + Duration::minutes(5);
    h.clock.set(m);
    assert!(h.tracker.resolve(&boss, Response::Missed, m).await.unwrap());

    let entity = h.tracker.entity(&boss).await.unwrap();
    assert_eq!(entity.next_window_start, Some(m + Duration::hours(22)));
    assert_eq!(entity.next_window_end, Some(m + Duration::hours(23)));
    assert!(entity.is_window);
    assert!(entity.pending_message.is_none());
    assert!(!h.armed_phases(&boss).await.contains(&Phase::AutoTimeout));
    assert_eq!(h.transport.stripped().len(), 1);
}

#[tokio::test]
async fn test_confirmed_kill_response_restarts_from_kill() {
    let h = Harness::new().await;
    let boss = h.add("Emeriss", 22, Some(26)).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;

    let killed = t0() + Duration::hours(22) + Duration::minutes(3);
    h.clock.set(killed);
    h.tracker
        .resolve(&boss, Response::ConfirmedKill, killed)
        .await
        .unwrap();

    let entity = h.tracker.entity(&boss).await.unwrap();
    assert_eq!(entity.last_resolved_at, Some(killed));
    assert_eq!(entity.next_window_start, Some(killed + Duration::hours(22)));
    assert!(!entity.is_window);
}

#[tokio::test]
async fn test_not_appeared_response_nudges_window() {
    let h = Harness::new().await;
    let boss = h.add("Taerar", 22, Some(26)).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;

    h.tracker
        .resolve(&boss, Response::NotAppeared, t0() + Duration::hours(22))
        .await
        .unwrap();

    let entity = h.tracker.entity(&boss).await.unwrap();
    assert_eq!(entity.next_window_start, Some(t0() + Duration::hours(23)));
    assert_eq!(entity.next_window_end, Some(t0() + Duration::hours(27)));
    assert!(entity.is_window);
    // Window start is still ahead, so the spawn alert is armed again
    assert!(h.armed_phases(&boss).await.contains(&Phase::SpawnAlert));
}

#[tokio::test]
async fn test_response_without_pending_alert_is_ignored() {
    let h = Harness::new().await;
    let boss = h.add("Ysondre", 22, Some(26)).await;
    let before = h.tracker.report_kill(&boss, t0()).await.unwrap();

    let handled = h
        .tracker
        .resolve(&boss, Response::Missed, t0())
        .await
        .unwrap();

    assert!(!handled);
    assert_eq!(h.tracker.entity(&boss).await.unwrap(), before);
}

#[tokio::test]
async fn test_stale_timer_has_no_effect() {
    let h = Harness::new().await;
    let boss = h.add("Lethon", 22, Some(26)).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    let old_spawn = h.live_timer(&boss, Phase::SpawnAlert).await;

    // Rescheduled before the old timer fires
    h.clock.set(t0() + Duration::hours(1));
    h.tracker
        .report_kill(&boss, t0() + Duration::hours(1))
        .await
        .unwrap();
    let before = h.tracker.entity(&boss).await.unwrap();

    h.clock.set(t0() + Duration::hours(22));
    h.tracker.handle_fired(old_spawn).await;

    assert!(h.transport.deliveries().is_empty());
    assert_eq!(h.tracker.entity(&boss).await.unwrap(), before);
}

#[tokio::test]
async fn test_schedule_all_twice_keeps_one_timer_per_phase() {
    let h = Harness::new().await;
    let boss = h.add("Onyxia", 120, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();

    h.tracker.schedule_all(&boss).await;
    h.tracker.schedule_all(&boss).await;

    assert_eq!(
        h.armed_phases(&boss).await,
        vec![Phase::PreAlert, Phase::SpawnAlert]
    );
}

#[tokio::test]
async fn test_schedule_all_without_prediction_is_noop() {
    let h = Harness::new().await;
    let boss = h.add("Onyxia", 120, None).await;

    h.tracker.schedule_all(&boss).await;

    assert!(h.armed_phases(&boss).await.is_empty());
}

#[tokio::test]
async fn test_close_window_arms_only_spawn_alert() {
    let h = Harness::new().await;
    let boss = h.add("Nefarian", 1, None).await;

    // Killed 55 minutes ago: window opens in 5 minutes, inside the pre-alert lead
    h.tracker
        .report_kill(&boss, t0() - Duration::minutes(55))
        .await
        .unwrap();

    assert_eq!(h.armed_phases(&boss).await, vec![Phase::SpawnAlert]);
}

#[tokio::test]
async fn test_future_kill_is_rejected_and_entity_unchanged() {
    let h = Harness::new().await;
    let boss = h.add("Ragnaros", 22, None).await;
    let before = h.tracker.entity(&boss).await.unwrap();

    let err = h
        .tracker
        .report_kill(&boss, t0() + Duration::minutes(1))
        .await
        .unwrap_err();

    assert!(matches!(err, TrackerError::InvalidInput(_)));
    assert_eq!(h.tracker.entity(&boss).await.unwrap(), before);
    assert!(h.armed_phases(&boss).await.is_empty());
}

#[tokio::test]
async fn test_duplicate_and_invalid_adds_are_rejected() {
    let h = Harness::new().await;
    h.add("Lord Kazzak", 22, Some(26)).await;

    let dup = h
        .tracker
        .add_entity(&h.group, common::boss("lord   KAZZAK", 22, None))
        .await
        .unwrap_err();
    assert!(matches!(dup, TrackerError::AlreadyExists(_)));

    let inverted = h
        .tracker
        .add_entity(&h.group, common::boss("Azuregos", 26, Some(22)))
        .await
        .unwrap_err();
    assert!(matches!(inverted, TrackerError::InvalidInput(_)));
    assert_eq!(h.tracker.status(&h.group).await.len(), 1);
}

#[tokio::test]
async fn test_delivery_falls_back_once() {
    let h = Harness::new().await;
    let boss = h.add("Hakkar", 22, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.transport.fail("alerts");

    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;

    let spawn = h.transport.deliveries_of(AlertKind::SpawnAlert);
    assert_eq!(spawn.len(), 1);
    assert_eq!(spawn[0].destination, Destination::new("backup"));
    let entity = h.tracker.entity(&boss).await.unwrap();
    assert_eq!(entity.pending_message, Some(spawn[0].message.clone()));
}

#[tokio::test]
async fn test_undeliverable_spawn_alert_leaves_boss_unnotified() {
    let h = Harness::new().await;
    let boss = h.add("Hakkar", 22, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.transport.fail("alerts");
    h.transport.fail("backup");

    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;

    let entity = h.tracker.entity(&boss).await.unwrap();
    assert!(entity.pending_message.is_none());
    assert!(entity.timers.spawn_alert.is_none());
    assert!(entity.timers.auto_timeout.is_none());
    assert!(!h.armed_phases(&boss).await.contains(&Phase::AutoTimeout));
}

#[tokio::test]
async fn test_auto_timeout_for_other_message_is_ignored() {
    let h = Harness::new().await;
    let boss = h.add("Gehennas", 22, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;

    let mut fired = h.live_timer(&boss, Phase::AutoTimeout).await;
    if let spawnwatch_tracker::TimerAction::AutoTimeout { message } = &mut fired.action {
        message.id = "some-older-message".to_string();
    }
    let before = h.tracker.entity(&boss).await.unwrap();

    h.clock.set(t0() + Duration::hours(22) + Duration::minutes(20));
    h.tracker.handle_fired(fired).await;

    let after = h.tracker.entity(&boss).await.unwrap();
    assert_eq!(after.pending_message, before.pending_message);
    assert_eq!(after.next_window_start, before.next_window_start);
    assert!(h.transport.stripped().is_empty());
}

#[tokio::test]
async fn test_kill_report_resolves_pending_alert() {
    let h = Harness::new().await;
    let boss = h.add("Magmadar", 22, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;
    let pending = h.tracker.entity(&boss).await.unwrap().pending_message.unwrap();

    let killed = t0() + Duration::hours(22) + Duration::minutes(1);
    h.clock.set(killed);
    h.tracker.report_kill(&boss, killed).await.unwrap();

    let entity = h.tracker.entity(&boss).await.unwrap();
    assert!(entity.pending_message.is_none());
    assert_eq!(h.transport.stripped(), vec![pending]);
    assert!(!h.armed_phases(&boss).await.contains(&Phase::AutoTimeout));
}

#[tokio::test]
async fn test_spawn_alert_superseded_during_delivery_is_stripped() {
    let h = Harness::new().await;
    let boss = h.add("Ragnaros", 22, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.clock.set(t0() + Duration::hours(22));
    let fired = h.live_timer(&boss, Phase::SpawnAlert).await;

    let gate = h.transport.hold_deliveries();
    let delivery = {
        let tracker = h.tracker.clone();
        tokio::spawn(async move { tracker.handle_fired(fired).await })
    };
    gate.entered.notified().await;

    // Killed while the spawn alert is still on its way
    let killed = t0() + Duration::hours(22) + Duration::minutes(1);
    h.clock.set(killed);
    h.tracker.report_kill(&boss, killed).await.unwrap();

    gate.release.notify_one();
    delivery.await.unwrap();

    let delivered = h.transport.deliveries_of(AlertKind::SpawnAlert);
    assert_eq!(delivered.len(), 1);
    assert_eq!(h.transport.stripped(), vec![delivered[0].message.clone()]);

    let entity = h.tracker.entity(&boss).await.unwrap();
    assert!(entity.pending_message.is_none());
    assert_eq!(entity.last_resolved_at, Some(killed));
    assert_eq!(entity.timers.get(Phase::AutoTimeout), None);
    assert!(!h.armed_phases(&boss).await.contains(&Phase::AutoTimeout));
    assert!(h.armed_phases(&boss).await.contains(&Phase::SpawnAlert));
}

#[tokio::test]
async fn test_oversized_interval_is_rejected() {
    let h = Harness::new().await;
    let mut request = common::boss("Nefarian", 22, None);
    request.min_interval = Duration::milliseconds((3.0e9 * 3_600_000.0_f64).round() as i64);

    let err = h.tracker.add_entity(&h.group, request).await.unwrap_err();

    assert!(matches!(err, TrackerError::InvalidInput(_)));
    assert!(h.tracker.status(&h.group).await.is_empty());
}

#[tokio::test]
async fn test_remove_cancels_timers_and_drops_late_fire() {
    let h = Harness::new().await;
    let boss = h.add("Garr", 22, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    let pre = h.live_timer(&boss, Phase::PreAlert).await;

    let removed = h.tracker.remove_entity(&boss).await.unwrap();
    assert_eq!(removed.key, boss.key);
    assert!(h.armed_phases(&boss).await.is_empty());

    h.clock.set(t0() + Duration::hours(22));
    h.tracker.handle_fired(pre).await;
    assert!(h.transport.deliveries().is_empty());

    let err = h.tracker.remove_entity(&boss).await.unwrap_err();
    assert!(matches!(err, TrackerError::NotFound(_)));
}

#[tokio::test]
async fn test_persistence_failure_keeps_memory_state() {
    let h = Harness::new().await;
    let boss = h.add("Shazzrah", 22, None).await;
    let saves = h.store.save_count();
    h.store.set_fail_writes(true);

    h.tracker.report_kill(&boss, t0()).await.unwrap();

    assert_eq!(h.store.save_count(), saves);
    let entity = h.tracker.entity(&boss).await.unwrap();
    assert_eq!(entity.next_window_start, Some(t0() + Duration::hours(22)));
}

#[tokio::test]
async fn test_set_channel_routes_new_and_existing_bosses() {
    let h = Harness::new().await;
    let mut request = common::boss("Sulfuron", 22, None);
    request.destination = None;
    request.fallback = None;
    let boss = h.tracker.add_entity(&h.group, request).await.unwrap();

    h.tracker
        .set_channel(&h.group, Destination::new("raid-alerts"))
        .await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();
    h.clock.set(t0() + Duration::hours(22));
    h.fire(&boss, Phase::SpawnAlert).await;

    let spawn = h.transport.deliveries_of(AlertKind::SpawnAlert);
    assert_eq!(spawn[0].destination, Destination::new("raid-alerts"));

    let mut later = common::boss("Golemagg", 22, None);
    later.destination = None;
    let later = h.tracker.add_entity(&h.group, later).await.unwrap();
    assert_eq!(
        h.tracker
            .entity(&later)
            .await
            .unwrap()
            .notification_destination,
        Some(Destination::new("raid-alerts"))
    );
}

#[tokio::test]
async fn test_status_orders_by_window() {
    let h = Harness::new().await;
    let late = h.add("Late", 30, None).await;
    let early = h.add("Early", 10, None).await;
    h.add("Unknown", 10, None).await;
    h.tracker.report_kill(&late, t0()).await.unwrap();
    h.tracker.report_kill(&early, t0()).await.unwrap();

    let names: Vec<String> = h
        .tracker
        .status(&h.group)
        .await
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["Early", "Late", "Unknown"]);
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_delivers_expired_timers() {
    let mut h = Harness::new().await;
    let boss = h.add("Baron Geddon", 1, None).await;
    h.tracker.report_kill(&boss, t0()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let fired_rx = std::mem::replace(&mut h.fired_rx, tokio::sync::mpsc::unbounded_channel().1);
    let dispatcher = {
        let tracker = h.tracker.clone();
        tokio::spawn(async move { tracker.run(fired_rx, shutdown_rx).await })
    };

    // Pre-alert is due 50 minutes out
    tokio::time::sleep(std::time::Duration::from_secs(55 * 60)).await;
    assert_eq!(h.transport.deliveries_of(AlertKind::PreAlert).len(), 1);
    assert!(h.transport.deliveries_of(AlertKind::SpawnAlert).is_empty());

    shutdown_tx.send(true).unwrap();
    dispatcher.await.unwrap();
}
