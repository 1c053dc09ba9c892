//! Public REST surface: queue admission/status/history and health,
//! grounded in `app/api/routes.py`.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use claw_core::queue::{EntryState, QueueEntry};
use claw_core::CoreError;
use protocol::{GameState, HealthResponse, JoinRequest, JoinResponse, QueueStatus, SessionResponse, StatusServerMessage};

use crate::error::ApiError;
use crate::ip::client_ip;
use crate::state::AppState;

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError(CoreError::Unauthorized))
}

fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') || email.len() > 254 {
        return Err(ApiError(CoreError::Validation("invalid email".into())));
    }
    Ok(email)
}

fn normalize_name(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() || name.chars().count() > 60 {
        return Err(ApiError(CoreError::Validation("invalid name".into())));
    }
    Ok(name.to_string())
}

pub async fn join(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let ip = client_ip(peer.ip(), &headers, &state.trusted_proxy_cidrs);
    let email = normalize_email(&body.email)?;
    let name = normalize_name(&body.name)?;
    let settings = &state.supervisor.settings;

    let ip_window = Duration::from_secs(3600);
    if !state.supervisor.rate_limiter.check(&format!("ip:{ip}"), settings.join_rate_limit_per_ip_per_hour, ip_window).await?
    {
        return Err(ApiError(CoreError::RateLimited));
    }
    if !state
        .supervisor
        .rate_limiter
        .check(&format!("email:{email}"), settings.join_rate_limit_per_email_per_hour, ip_window)
        .await?
    {
        return Err(ApiError(CoreError::RateLimited));
    }

    let joined = state.supervisor.queue.join(name, email, ip).await?;
    state.supervisor.turn.advance_queue().await;
    broadcast_queue_update(&state).await;

    Ok(Json(JoinResponse {
        token: joined.token,
        position: joined.position.max(0) as u32,
        estimated_wait_seconds: (joined.position.max(0) as u64).saturating_mul(settings.turn_time_seconds),
    }))
}

pub async fn leave(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(&headers)?;
    let token_hash = claw_core::store::hash_token(token);
    let left = state.supervisor.queue.leave(token_hash).await?;
    if !left {
        return Err(ApiError(CoreError::NotFound));
    }
    broadcast_queue_update(&state).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn broadcast_queue_update(state: &AppState) {
    if let Ok(status) = state.supervisor.queue.get_queue_status().await {
        state
            .supervisor
            .fanout
            .broadcast(StatusServerMessage::QueueUpdate(QueueStatus {
                current_player: status.current_player,
                current_player_state: status.current_player_state,
                queue_length: status.queue_length.max(0) as u32,
            }))
            .await;
    }
}

pub async fn queue_status(State(state): State<AppState>) -> Result<Json<QueueStatus>, ApiError> {
    let status = state.supervisor.queue.get_queue_status().await?;
    Ok(Json(QueueStatus {
        current_player: status.current_player,
        current_player_state: status.current_player_state,
        queue_length: status.queue_length.max(0) as u32,
    }))
}

#[derive(Serialize)]
pub struct PublicQueueEntry {
    pub id: String,
    pub name: String,
    pub state: EntryState,
    pub position: Option<i64>,
    pub created_at: String,
}

impl From<QueueEntry> for PublicQueueEntry {
    fn from(e: QueueEntry) -> Self {
        PublicQueueEntry { id: e.id, name: e.name, state: e.state, position: e.position, created_at: e.created_at }
    }
}

pub async fn list_queue(State(state): State<AppState>) -> Result<Json<Vec<PublicQueueEntry>>, ApiError> {
    let entries = state.supervisor.queue.list_queue().await?;
    Ok(Json(entries.into_iter().map(PublicQueueEntry::from).collect()))
}

pub async fn session_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<SessionResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    let token_hash = claw_core::store::hash_token(token);
    let entry = state.supervisor.queue.get_by_token(token_hash).await?.ok_or(CoreError::NotFound)?;

    let position = state.supervisor.queue.get_waiting_rank(entry.id.clone()).await?.map(|r| r.max(0) as u32);

    let (tries_left, current_try) = if entry.state == EntryState::Active {
        let snapshot = state.supervisor.turn.snapshot().await;
        if snapshot.active_entry_id.as_deref() == Some(entry.id.as_str()) {
            (Some(snapshot.tries_per_player.saturating_sub(snapshot.current_try)), Some(snapshot.current_try))
        } else {
            (Some(state.supervisor.settings.tries_per_player), None)
        }
    } else {
        (Some(state.supervisor.settings.tries_per_player), None)
    };

    Ok(Json(SessionResponse {
        state: entry_state_str(entry.state).to_string(),
        position,
        tries_left,
        current_try,
    }))
}

fn entry_state_str(state: EntryState) -> &'static str {
    match state {
        EntryState::Waiting => "waiting",
        EntryState::Ready => "ready",
        EntryState::Active => "active",
        EntryState::Done => "done",
        EntryState::Cancelled => "cancelled",
    }
}

#[derive(Serialize)]
pub struct HistoryEntry {
    pub name: String,
    pub result: Option<String>,
    pub tries_used: u32,
    pub completed_at: Option<String>,
}

pub async fn history(State(state): State<AppState>) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let entries = state.supervisor.queue.get_recent_results(20).await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|e| HistoryEntry { name: e.name, result: e.result, tries_used: e.tries_used, completed_at: e.completed_at })
            .collect(),
    ))
}

pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, StatusCode> {
    let game_state: GameState = state.supervisor.turn.state().await;
    let queue_length = state.supervisor.queue.get_waiting_count().await.unwrap_or(0).max(0) as u32;
    Ok(Json(HealthResponse {
        status: "ok",
        game_state,
        gpio_locked: state.supervisor.hardware.is_locked(),
        queue_length,
        viewer_count: state.supervisor.fanout.viewer_count().await as u32,
        uptime_seconds: state.uptime_seconds(),
    }))
}
