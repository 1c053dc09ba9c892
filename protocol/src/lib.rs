//! Wire types shared between the server and any client: REST DTOs and the
//! tagged WebSocket message unions for `/ws/control` and `/ws/status`.
//!
//! Everything here is `serde` only — no logic, no I/O. The control and
//! status sockets exchange newline-delimited JSON text frames; each message
//! carries a `"type"` tag that selects the variant.

use serde::{Deserialize, Serialize};

/// Normal closure: the socket's owning entry finished its turn or the
/// connection was intentionally replaced by a newer one for the same token.
pub const CLOSE_REPLACED: u16 = 1000;
/// The server stopped observing activity/keepalive from this socket in time.
pub const CLOSE_LIVENESS: u16 = 1001;
/// Authentication failed or was never completed within the grace window.
pub const CLOSE_AUTH_FAILED: u16 = 1008;
/// The viewer or control socket admission cap was already full.
pub const CLOSE_CAPACITY: u16 = 1013;

/// Directional inputs a player can hold down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

/// Messages a control client may send after authenticating.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlClientMessage {
    /// Must be the first message on the socket. Anything else first is a
    /// protocol violation and closes with [`CLOSE_AUTH_FAILED`].
    Auth { token: String },
    Keydown { key: Direction },
    Keyup { key: Direction },
    DropStart,
    DropEnd,
    ReadyConfirm,
    LatencyPing { sent_at_ms: u64 },
}

/// Messages the server sends on `/ws/control`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlServerMessage {
    AuthOk { entry_id: String },
    Error { message: String },
    StateUpdate(StateUpdate),
    ReadyPrompt { timeout_seconds: u32 },
    TurnEnd { result: TurnResult, tries_used: u32 },
    ControlAck { key: Direction, active: bool },
    Ping,
    LatencyPong { sent_at_ms: u64 },
}

/// Messages the server sends on `/ws/status` (broadcast only, no client
/// messages are ever parsed — the socket is receive-inert).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusServerMessage {
    Ping,
    StateUpdate(StateUpdate),
    QueueUpdate(QueueStatus),
    TurnEnd { entry_id: String, result: TurnResult, tries_used: u32 },
}

/// A snapshot of the turn state machine, broadcast on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdate {
    pub game_state: GameState,
    pub active_entry_id: Option<String>,
    pub active_player_name: Option<String>,
    pub current_try: u32,
    pub tries_per_player: u32,
    pub deadline_ms: Option<u64>,
}

/// Turn state machine variants, mirrored 1:1 from the orchestration core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameState {
    Idle,
    ReadyPrompt,
    Moving,
    Dropping,
    PostDrop,
    TurnEnd,
}

/// Terminal outcome of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnResult {
    Win,
    Loss,
    Skipped,
    Expired,
    AdminSkipped,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub current_player: Option<String>,
    pub current_player_state: Option<String>,
    pub queue_length: u32,
}

// -- REST DTOs ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinResponse {
    pub token: String,
    pub position: u32,
    pub estimated_wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub state: String,
    pub position: Option<u32>,
    pub tries_left: Option<u32>,
    pub current_try: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub game_state: GameState,
    pub gpio_locked: bool,
    pub queue_length: u32,
    pub viewer_count: u32,
    pub uptime_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_round_trips() {
        let msg = ControlClientMessage::Auth { token: "abc123".into() };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"auth\""));
        let decoded: ControlClientMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            ControlClientMessage::Auth { token } => assert_eq!(token, "abc123"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn keydown_tags_direction_lowercase() {
        let msg = ControlClientMessage::Keydown { key: Direction::North };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert_eq!(encoded, r#"{"type":"keydown","key":"north"}"#);
    }

    #[test]
    fn game_state_is_screaming_snake_case() {
        let encoded = serde_json::to_string(&GameState::ReadyPrompt).unwrap();
        assert_eq!(encoded, "\"READY_PROMPT\"");
    }
}
