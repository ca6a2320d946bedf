//! Spawn window estimation.
//!
//! Pure functions turning an observation about a boss into a new
//! [`Prediction`]. Each observation carries different evidence:
//! - a confirmed kill anchors a fresh estimate on the kill time
//! - a miss (or an unanswered spawn alert) re-arms conservatively from now
//! - "not appeared" nudges the existing window forward without discarding it

use chrono::{DateTime, Duration, Utc};

use crate::{Entity, Prediction, TrackerError};

/// Increment applied by "not appeared", and the fallback window width when
/// no maximum interval is configured.
const GRACE_MINUTES: i64 = 60;

pub fn grace() -> Duration {
    Duration::minutes(GRACE_MINUTES)
}

/// `at + by`, or `InvalidInput` when the result is not a representable time.
fn offset(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, TrackerError> {
    at.checked_add_signed(by).ok_or_else(|| {
        TrackerError::InvalidInput(format!(
            "respawn time out of range: {} + {} minutes",
            at.to_rfc3339(),
            by.num_minutes()
        ))
    })
}

/// A confirmed kill at `resolved_at`.
///
/// Rejects kill times later than `now`.
pub fn on_resolved(
    entity: &Entity,
    resolved_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Prediction, TrackerError> {
    if resolved_at > now {
        return Err(TrackerError::InvalidInput(format!(
            "kill time {} is in the future",
            resolved_at.to_rfc3339()
        )));
    }

    let start = offset(resolved_at, entity.min_interval())?;
    Ok(Prediction {
        last_resolved_at: Some(resolved_at),
        next_window_start: start,
        next_window_end: entity
            .interval_spread()
            .map(|spread| offset(start, spread))
            .transpose()?,
        is_window: false,
    })
}

/// The boss was missed at `now`.
pub fn on_missed(entity: &Entity, now: DateTime<Utc>) -> Result<Prediction, TrackerError> {
    let start = offset(now, entity.min_interval())?;
    let end = offset(start, entity.interval_spread().unwrap_or_else(grace))?;
    Ok(Prediction {
        last_resolved_at: None,
        next_window_start: start,
        next_window_end: Some(end),
        is_window: true,
    })
}

/// The boss did not show up in its predicted window.
///
/// Shifts the previous window by [`grace`]. Without a previous estimate the
/// shift is anchored on `now`.
pub fn on_not_appeared(entity: &Entity, now: DateTime<Utc>) -> Result<Prediction, TrackerError> {
    let start = offset(entity.next_window_start.unwrap_or(now), grace())?;
    let mut end = match (entity.next_window_end, entity.interval_spread()) {
        (Some(end), _) => offset(end, grace())?,
        (None, Some(spread)) => offset(start, spread)?,
        (None, None) => offset(start, grace())?,
    };
    if end <= start {
        end = offset(start, grace())?;
    }
    Ok(Prediction {
        last_resolved_at: entity.last_resolved_at,
        next_window_start: start,
        next_window_end: Some(end),
        is_window: true,
    })
}

/// Nobody answered the spawn alert before the response timeout; treated as
/// a miss at `now`.
pub fn on_auto_timeout(entity: &Entity, now: DateTime<Utc>) -> Result<Prediction, TrackerError> {
    on_missed(entity, now)
}
