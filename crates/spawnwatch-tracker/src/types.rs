//! Tracker types.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::TrackerError;

/// An isolated namespace of tracked bosses (one per served community).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of a boss within its group, derived from the display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(pub String);

impl EntityKey {
    /// Derive a key from a display name.
    ///
    /// Case-folds and collapses whitespace runs, so "Lord  Kazzak " and
    /// "lord kazzak" map to the same key. Returns `None` for blank names.
    pub fn from_name(name: &str) -> Option<Self> {
        let key = name
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        if key.is_empty() { None } else { Some(Self(key)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of one boss.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub group: GroupId,
    pub key: EntityKey,
}

impl EntityRef {
    pub fn new(group: GroupId, key: EntityKey) -> Self {
        Self { group, key }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.key)
    }
}

/// Where alerts are delivered (a channel id, opaque to the tracker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(pub String);

impl Destination {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a delivered message, as returned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub destination: Destination,
    pub id: String,
}

/// One of the three alert phases, each with its own timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreAlert,
    SpawnAlert,
    AutoTimeout,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::PreAlert, Phase::SpawnAlert, Phase::AutoTimeout];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::PreAlert => "pre_alert",
            Phase::SpawnAlert => "spawn_alert",
            Phase::AutoTimeout => "auto_timeout",
        })
    }
}

/// Generation token identifying one scheduling of one timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u64);

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live timer tokens of an entity, one slot per phase. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTokens {
    pub pre_alert: Option<TimerToken>,
    pub spawn_alert: Option<TimerToken>,
    pub auto_timeout: Option<TimerToken>,
}

impl PhaseTokens {
    pub fn get(&self, phase: Phase) -> Option<TimerToken> {
        match phase {
            Phase::PreAlert => self.pre_alert,
            Phase::SpawnAlert => self.spawn_alert,
            Phase::AutoTimeout => self.auto_timeout,
        }
    }

    pub fn slot_mut(&mut self, phase: Phase) -> &mut Option<TimerToken> {
        match phase {
            Phase::PreAlert => &mut self.pre_alert,
            Phase::SpawnAlert => &mut self.spawn_alert,
            Phase::AutoTimeout => &mut self.auto_timeout,
        }
    }

    /// True when no phase has a live timer.
    pub fn is_idle(&self) -> bool {
        Phase::ALL.iter().all(|p| self.get(*p).is_none())
    }
}

/// A user's answer to a spawn alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    /// The boss appeared and was killed.
    ConfirmedKill,
    /// The boss was missed; nobody saw it die.
    Missed,
    /// The boss has not appeared yet.
    NotAppeared,
}

/// A request to start tracking a boss.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub name: String,
    pub location: String,
    pub min_interval: Duration,
    pub max_interval: Option<Duration>,
    pub destination: Option<Destination>,
    pub fallback: Option<Destination>,
}

/// Longest accepted respawn interval, in hours.
pub const MAX_INTERVAL_HOURS: i64 = 24 * 366;

/// A tracked boss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Normalized name; unique within the group.
    pub key: EntityKey,
    /// Display name as entered.
    pub name: String,
    /// Where the boss spawns.
    pub location: String,
    /// Shortest respawn interval.
    pub min_interval_ms: i64,
    /// Longest respawn interval, if known.
    pub max_interval_ms: Option<i64>,
    /// Time of the last confirmed kill.
    pub last_resolved_at: Option<DateTime<Utc>>,
    /// Start of the predicted spawn window.
    pub next_window_start: Option<DateTime<Utc>>,
    /// End of the predicted spawn window; absent for a point estimate.
    pub next_window_end: Option<DateTime<Utc>>,
    /// Whether the estimate came from a miss rather than a confirmed kill.
    #[serde(default)]
    pub is_window: bool,
    /// Spawn alert awaiting a user response.
    pub pending_message: Option<MessageRef>,
    /// Primary alert destination.
    pub notification_destination: Option<Destination>,
    /// Destination used when the primary one fails.
    pub fallback_destination: Option<Destination>,
    /// When tracking started.
    pub created_at: DateTime<Utc>,
    /// Live timer tokens.
    #[serde(skip)]
    pub timers: PhaseTokens,
}

/// A freshly computed spawn estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prediction {
    pub last_resolved_at: Option<DateTime<Utc>>,
    pub next_window_start: DateTime<Utc>,
    pub next_window_end: Option<DateTime<Utc>>,
    pub is_window: bool,
}

impl Entity {
    /// Validate a request and build an entity with no prediction yet.
    pub fn create(request: NewEntity, now: DateTime<Utc>) -> Result<Self, TrackerError> {
        let key = EntityKey::from_name(&request.name)
            .ok_or_else(|| TrackerError::InvalidInput("boss name cannot be empty".to_string()))?;

        if request.min_interval <= Duration::zero() {
            return Err(TrackerError::InvalidInput(
                "minimum respawn interval must be positive".to_string(),
            ));
        }
        let cap = Duration::hours(MAX_INTERVAL_HOURS);
        if request.min_interval > cap || request.max_interval.is_some_and(|max| max > cap) {
            return Err(TrackerError::InvalidInput(format!(
                "respawn intervals cannot exceed {} hours",
                MAX_INTERVAL_HOURS
            )));
        }
        if let Some(max) = request.max_interval {
            if max < request.min_interval {
                return Err(TrackerError::InvalidInput(format!(
                    "maximum respawn interval ({}m) is shorter than the minimum ({}m)",
                    max.num_minutes(),
                    request.min_interval.num_minutes()
                )));
            }
        }

        Ok(Self {
            key,
            name: request.name.trim().to_string(),
            location: request.location.trim().to_string(),
            min_interval_ms: request.min_interval.num_milliseconds(),
            max_interval_ms: request.max_interval.map(|d| d.num_milliseconds()),
            last_resolved_at: None,
            next_window_start: None,
            next_window_end: None,
            is_window: false,
            pending_message: None,
            notification_destination: request.destination,
            fallback_destination: request.fallback,
            created_at: now,
            timers: PhaseTokens::default(),
        })
    }

    pub fn min_interval(&self) -> Duration {
        Duration::milliseconds(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Option<Duration> {
        self.max_interval_ms.map(Duration::milliseconds)
    }

    /// Spread between the interval bounds, when the max is strictly larger.
    pub fn interval_spread(&self) -> Option<Duration> {
        self.max_interval()
            .filter(|max| *max > self.min_interval())
            .map(|max| max - self.min_interval())
    }

    /// Overwrite the prediction fields.
    pub fn apply(&mut self, prediction: Prediction) {
        self.last_resolved_at = prediction.last_resolved_at;
        self.next_window_start = Some(prediction.next_window_start);
        self.next_window_end = prediction.next_window_end;
        self.is_window = prediction.is_window;
    }
}
