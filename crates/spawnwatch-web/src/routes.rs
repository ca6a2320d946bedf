//! Web routes.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use spawnwatch_tracker::{
    Destination, Entity, EntityKey, EntityRef, GroupId, MAX_INTERVAL_HOURS, NewEntity, Response,
    Tracker,
};

use crate::WebError;

/// Shared state for the web server.
pub struct AppState {
    pub tracker: Tracker,
}

/// Create the web router.
pub fn create_router(tracker: Tracker) -> Router {
    let state = Arc::new(AppState { tracker });

    Router::new()
        .route("/health", get(health))
        // Bosses
        .route("/groups/{group}/bosses", get(list_bosses).post(add_boss))
        .route("/groups/{group}/bosses/{key}/kill", post(report_kill))
        .route("/groups/{group}/bosses/{key}/missed", post(report_missed))
        .route("/groups/{group}/bosses/{key}/delete", post(remove_boss))
        .route("/groups/{group}/bosses/{key}/respond", post(respond))
        // Group settings
        .route("/groups/{group}/channel", post(set_channel))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AddBossRequest {
    name: String,
    #[serde(default)]
    location: String,
    min_hours: f64,
    max_hours: Option<f64>,
    destination: Option<String>,
    fallback: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KillRequest {
    killed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct MissedRequest {
    at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    response: Response,
    responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ChannelRequest {
    destination: String,
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn list_bosses(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> Json<Vec<Entity>> {
    Json(state.tracker.status(&GroupId::new(group)).await)
}

async fn add_boss(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Json(body): Json<AddBossRequest>,
) -> Result<impl IntoResponse, WebError> {
    let request = NewEntity {
        name: body.name,
        location: body.location,
        min_interval: hours(body.min_hours)?,
        max_interval: body.max_hours.map(hours).transpose()?,
        destination: non_empty(body.destination).map(Destination::new),
        fallback: non_empty(body.fallback).map(Destination::new),
    };

    let entity_ref = state
        .tracker
        .add_entity(&GroupId::new(group), request)
        .await?;
    let entity = state
        .tracker
        .entity(&entity_ref)
        .await
        .ok_or_else(|| spawnwatch_tracker::TrackerError::NotFound(entity_ref.clone()))?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn report_kill(
    State(state): State<Arc<AppState>>,
    Path((group, key)): Path<(String, String)>,
    body: Option<Json<KillRequest>>,
) -> Result<Json<Entity>, WebError> {
    let entity_ref = entity_ref(group, &key)?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let killed_at = body.killed_at.unwrap_or_else(|| state.tracker.now());

    let entity = state.tracker.report_kill(&entity_ref, killed_at).await?;
    Ok(Json(entity))
}

async fn report_missed(
    State(state): State<Arc<AppState>>,
    Path((group, key)): Path<(String, String)>,
    body: Option<Json<MissedRequest>>,
) -> Result<Json<Entity>, WebError> {
    let entity_ref = entity_ref(group, &key)?;
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let at = body.at.unwrap_or_else(|| state.tracker.now());

    let entity = state.tracker.report_missed(&entity_ref, at).await?;
    Ok(Json(entity))
}

async fn remove_boss(
    State(state): State<Arc<AppState>>,
    Path((group, key)): Path<(String, String)>,
) -> Result<Json<Entity>, WebError> {
    let entity_ref = entity_ref(group, &key)?;
    let removed = state.tracker.remove_entity(&entity_ref).await?;
    Ok(Json(removed))
}

async fn respond(
    State(state): State<Arc<AppState>>,
    Path((group, key)): Path<(String, String)>,
    Json(body): Json<RespondRequest>,
) -> Result<impl IntoResponse, WebError> {
    let entity_ref = entity_ref(group, &key)?;
    let responded_at = body.responded_at.unwrap_or_else(|| state.tracker.now());

    let handled = state
        .tracker
        .resolve(&entity_ref, body.response, responded_at)
        .await?;
    if !handled {
        info!(entity = %entity_ref, "response to an alert that is no longer pending");
    }
    Ok(Json(json!({ "handled": handled })))
}

async fn set_channel(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
    Json(body): Json<ChannelRequest>,
) -> Result<impl IntoResponse, WebError> {
    let destination = non_empty(Some(body.destination))
        .ok_or_else(|| WebError::BadRequest("destination cannot be empty".to_string()))?;
    let group = GroupId::new(group);

    state
        .tracker
        .set_channel(&group, Destination::new(destination.clone()))
        .await;
    Ok(Json(json!({ "group": group, "destination": destination })))
}

/// Resolve a path segment to a boss. Accepts the display name as well as
/// the normalized key.
fn entity_ref(group: String, key: &str) -> Result<EntityRef, WebError> {
    let key = EntityKey::from_name(key)
        .ok_or_else(|| WebError::BadRequest("boss key cannot be empty".to_string()))?;
    Ok(EntityRef::new(GroupId::new(group), key))
}

fn hours(value: f64) -> Result<Duration, WebError> {
    if !(0.0..=MAX_INTERVAL_HOURS as f64).contains(&value) {
        return Err(WebError::BadRequest(format!(
            "hour count must be between 0 and {MAX_INTERVAL_HOURS}: {value}"
        )));
    }
    Ok(Duration::milliseconds((value * 3_600_000.0).round() as i64))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
