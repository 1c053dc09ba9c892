//! Admin surface: operator controls gated behind `X-Admin-Key`, grounded
//! in `app/api/admin_routes.py`. Every handler here runs the key check
//! first via the [`require_admin`] extractor-equivalent helper.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use subtle::ConstantTimeEq;

use claw_core::queue::AdminQueueEntry;
use claw_core::CoreError;
use protocol::TurnResult;

use crate::error::ApiError;
use crate::state::AppState;

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers.get("x-admin-key").and_then(|v| v.to_str().ok()).unwrap_or("");
    let expected = state.supervisor.settings.admin_api_key.as_bytes();
    if provided.as_bytes().ct_eq(expected).into() {
        Ok(())
    } else {
        Err(ApiError(CoreError::Unauthorized))
    }
}

pub async fn advance(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.supervisor.turn.advance_queue().await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn pause(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.supervisor.turn.pause();
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn resume(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.supervisor.turn.resume();
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn emergency_stop(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.supervisor.turn.force_recover().await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn unlock(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state.supervisor.hardware.unlock().await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// Kick a queue entry. Active players are force-ended via the turn state
/// machine; waiting/ready entries are cancelled directly, since they were
/// never handed to the state machine in the first place.
pub async fn kick(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entry_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    if state.supervisor.turn.active_entry_id().await.as_deref() == Some(entry_id.as_str()) {
        state.supervisor.turn.force_end_turn(TurnResult::AdminSkipped).await;
        return Ok(Json(serde_json::json!({ "ok": true })));
    }
    let cancelled = state.supervisor.queue.cancel_entry(entry_id).await?;
    if !cancelled {
        return Err(ApiError(CoreError::NotFound));
    }
    if let Ok(status) = state.supervisor.queue.get_queue_status().await {
        state
            .supervisor
            .fanout
            .broadcast(protocol::StatusServerMessage::QueueUpdate(protocol::QueueStatus {
                current_player: status.current_player,
                current_player_state: status.current_player_state,
                queue_length: status.queue_length.max(0) as u32,
            }))
            .await;
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Serialize)]
pub struct DashboardResponse {
    pub game_state: protocol::GameState,
    pub paused: bool,
    pub gpio_locked: bool,
    pub viewer_count: u32,
    pub control_connections: u32,
    pub stats: claw_core::queue::QueueStats,
}

pub async fn dashboard(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<DashboardResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let stats = state.supervisor.queue.get_stats().await?;
    Ok(Json(DashboardResponse {
        game_state: state.supervisor.turn.state().await,
        paused: state.supervisor.turn.is_paused(),
        gpio_locked: state.supervisor.hardware.is_locked(),
        viewer_count: state.supervisor.fanout.viewer_count().await as u32,
        control_connections: state.supervisor.control.connection_count(),
        stats,
    }))
}

pub async fn queue_details(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<AdminQueueEntry>>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.supervisor.queue.list_queue_admin().await?))
}

#[derive(Serialize)]
pub struct ConfigResponse {
    #[serde(flatten)]
    settings: claw_core::Settings,
    restart_required: bool,
}

pub async fn get_config(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(ConfigResponse { settings: (*state.supervisor.settings).clone(), restart_required: false }))
}

/// Validates and persists a partial config patch to disk. Does not hot-apply
/// to the running process: too much of the wiring (hardware gate, turn
/// state machine, control channel) is constructed once at startup from an
/// `Arc<Settings>` for this to be safe to swap live. The response always
/// carries `restart_required: true` on success so an operator knows to
/// restart the process for the new values to take effect.
pub async fn put_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let patched = state
        .supervisor
        .settings
        .apply_patch(&patch)
        .map_err(|e| ApiError(CoreError::Validation(e.to_string())))?;
    patched.save(claw_core::Settings::resolve_path())?;
    Ok(Json(ConfigResponse { settings: patched, restart_required: true }))
}
