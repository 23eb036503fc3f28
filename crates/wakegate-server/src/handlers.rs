//! Route handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use wakegate_core::ids::SessionId;
use wakegate_core::wire::parse_inbound;

use crate::error::ApiError;
use crate::health::health_check;
use crate::server::AppState;

/// Broker bridge envelope: one inbound MQTT publish.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub topic: String,
    pub payload: Value,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// `POST /ingest`: answer with the command to publish, or 204.
#[instrument(skip_all, fields(topic = %request.topic))]
pub async fn ingest(State(state): State<AppState>, Json(request): Json<IngestRequest>) -> Result<Response, ApiError> {
    let message = parse_inbound(&request.topic, &request.payload)?;
    let received_at = request.received_at.unwrap_or_else(Utc::now);
    match state.router.dispatch(message, received_at).await? {
        Some(command) => Ok(Json(command).into_response()),
        None => {
            debug!("no command for message");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// `GET /devices/{mac}`
pub async fn get_device(State(state): State<AppState>, Path(mac): Path<String>) -> Result<Response, ApiError> {
    let device = state
        .router
        .engine()
        .devices()
        .find_by_mac(&mac)
        .map_err(wakegate_engine::EngineError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("device {mac}")))?;
    Ok(Json(device).into_response())
}

/// `GET /sessions/{id}`
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let session = state.router.engine().sessions().get(&SessionId::from_raw(id))?;
    Ok(Json(session).into_response())
}

/// `POST /sessions/{id}/snapshots/{round}`: (re)generate one round.
#[instrument(skip(state, window))]
pub async fn generate_snapshot(
    State(state): State<AppState>,
    Path((id, round)): Path<(String, u32)>,
    Json(window): Json<SnapshotWindow>,
) -> Result<Response, ApiError> {
    let row = state.router.engine().snapshots().generate(
        &SessionId::from_raw(id),
        round,
        window.window_start,
        window.window_end,
        Utc::now(),
    )?;
    Ok((StatusCode::CREATED, Json(row)).into_response())
}

/// `GET /sessions/{id}/snapshots/{round}`
pub async fn get_snapshot(
    State(state): State<AppState>,
    Path((id, round)): Path<(String, u32)>,
) -> Result<Response, ApiError> {
    let row = state
        .router
        .engine()
        .snapshots()
        .get(&SessionId::from_raw(id.as_str()), round)?
        .ok_or_else(|| ApiError::NotFound(format!("snapshot {id}/{round}")))?;
    Ok(Json(row).into_response())
}

/// `GET /sessions/{id}/snapshots`
pub async fn list_snapshots(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let rows = state.router.engine().snapshots().list(&SessionId::from_raw(id))?;
    Ok(Json(rows).into_response())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(health_check(state.started_at, state.router.active_workers()))
}
