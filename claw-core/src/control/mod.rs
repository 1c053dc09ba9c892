//! Control Channel: the authenticated per-player command path for
//! `/ws/control`. Owns connection registration/replacement, command rate
//! limiting, liveness bookkeeping, and grace-period disconnect handling.
//!
//! Like [`crate::turn`], this module never holds a concrete reference to
//! its counterpart — it drives [`crate::turn::TurnStateMachine`] through
//! the narrow [`crate::turn::ActiveTurnView`] trait, bound in once after
//! both sides exist (see [`ControlChannel::bind_turn_view`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, OnceCell};

use protocol::{ControlClientMessage, ControlServerMessage, GameState};

use crate::config::Settings;
use crate::hardware::{Direction, HardwareGate};
use crate::turn::{ActiveTurnView, PlayerNotifier};

struct Connection {
    tx: mpsc::UnboundedSender<ControlServerMessage>,
    connected: bool,
    last_activity: Instant,
    window_start: Instant,
    window_count: u32,
    disconnect_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct ControlChannel {
    self_ref: std::sync::Weak<ControlChannel>,
    hardware: Arc<dyn HardwareGate>,
    settings: Arc<Settings>,
    turn_view: OnceCell<Arc<dyn ActiveTurnView>>,
    connections: Mutex<HashMap<String, Connection>>,
    connection_count: AtomicU32,
}

impl ControlChannel {
    pub fn new(hardware: Arc<dyn HardwareGate>, settings: Arc<Settings>) -> Arc<ControlChannel> {
        Arc::new_cyclic(|self_ref| ControlChannel {
            self_ref: self_ref.clone(),
            hardware,
            settings,
            turn_view: OnceCell::new(),
            connections: Mutex::new(HashMap::new()),
            connection_count: AtomicU32::new(0),
        })
    }

    /// Wire up the turn state machine side of the circular dependency.
    /// Called exactly once by the supervisor during startup.
    pub fn bind_turn_view(&self, view: Arc<dyn ActiveTurnView>) {
        if self.turn_view.set(view).is_err() {
            tracing::warn!("bind_turn_view called more than once, ignoring");
        }
    }

    fn self_arc(&self) -> Arc<ControlChannel> {
        self.self_ref.upgrade().expect("control channel used after being dropped")
    }

    fn view(&self) -> Option<&Arc<dyn ActiveTurnView>> {
        self.turn_view.get()
    }

    /// Number of currently-connected control sockets, for the admin
    /// dashboard and the capacity cap in `claw-server`.
    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Register a freshly authenticated connection for `entry_id`. Any
    /// prior connection for the same entry is implicitly replaced — its
    /// sender is dropped here, which makes that connection's own forward
    /// loop observe a closed channel and close with 1000.
    pub async fn register(&self, entry_id: String) -> mpsc::UnboundedReceiver<ControlServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connections = self.connections.lock().await;
        let now = Instant::now();
        if let Some(existing) = connections.get_mut(&entry_id) {
            if let Some(task) = existing.disconnect_task.take() {
                task.abort();
            }
            existing.tx = tx;
            existing.connected = true;
            existing.last_activity = now;
            existing.window_start = now;
            existing.window_count = 0;
        } else {
            connections.insert(
                entry_id,
                Connection {
                    tx,
                    connected: true,
                    last_activity: now,
                    window_start: now,
                    window_count: 0,
                    disconnect_task: None,
                },
            );
            self.connection_count.fetch_add(1, Ordering::Relaxed);
        }
        rx
    }

    /// Called when a control socket's read loop ends for any reason
    /// (client closed, write failed, liveness timeout). Stops any
    /// direction the player was holding immediately. A reconnect grace
    /// window is only started for the active player mid-turn
    /// (MOVING/DROPPING/POST_DROP) — READY_PROMPT's own timeout already
    /// governs that state, and no other entry has anything to forfeit.
    /// Everyone else's bookkeeping is dropped immediately via
    /// [`Self::forget`], which is also what releases the slot this
    /// entry holds against `max_control_connections`.
    pub async fn unregister(&self, entry_id: &str) {
        {
            let mut connections = self.connections.lock().await;
            let Some(conn) = connections.get_mut(entry_id) else { return };
            conn.connected = false;
            if let Some(task) = conn.disconnect_task.take() {
                task.abort();
            }
        }

        if let Err(e) = self.hardware.all_directions_off().await {
            tracing::warn!(error = %e, entry_id, "all_directions_off failed on disconnect");
        }
        if let Some(view) = self.view() {
            view.handle_disconnect(entry_id).await;
        }

        let mid_turn = match self.view() {
            Some(view) => {
                let is_active = view.active_entry_id().await.as_deref() == Some(entry_id);
                is_active && matches!(view.current_state().await, GameState::Moving | GameState::Dropping | GameState::PostDrop)
            }
            None => false,
        };

        if !mid_turn {
            self.forget(entry_id).await;
            return;
        }

        let grace = Duration::from_secs(self.settings.queue_grace_period_seconds);
        let this = self.self_arc();
        let entry_id_owned = entry_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_disconnected = {
                let connections = this.connections.lock().await;
                connections.get(&entry_id_owned).map(|c| !c.connected).unwrap_or(true)
            };
            if still_disconnected {
                if let Some(view) = this.view() {
                    view.handle_disconnect_timeout(&entry_id_owned).await;
                }
                this.forget(&entry_id_owned).await;
            }
        });

        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get_mut(entry_id) {
            conn.disconnect_task = Some(task);
        }
    }

    /// Drop all bookkeeping for an entry and release its slot against
    /// `max_control_connections`. Safe to call on an entry that still
    /// has a live socket (the reconnect path in [`Self::register`]
    /// simply reinserts and re-counts it).
    pub async fn forget(&self, entry_id: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(mut conn) = connections.remove(entry_id) {
            if let Some(task) = conn.disconnect_task.take() {
                task.abort();
            }
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// `true` if no command/ping has been seen from `entry_id` within
    /// `max_idle` — the caller's read loop is expected to poll this on a
    /// tick and close with 1001 if it ever returns `true`.
    pub async fn is_stale(&self, entry_id: &str, max_idle: Duration) -> bool {
        let connections = self.connections.lock().await;
        match connections.get(entry_id) {
            Some(conn) => conn.connected && conn.last_activity.elapsed() > max_idle,
            None => false,
        }
    }

    async fn touch_activity(&self, entry_id: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get_mut(entry_id) {
            conn.last_activity = Instant::now();
        }
    }

    /// Sliding-window check against `command_rate_limit_hz`, one window
    /// per connection so one abusive player can't cost another their
    /// allowance.
    async fn check_rate_limit(&self, entry_id: &str) -> bool {
        let mut connections = self.connections.lock().await;
        let Some(conn) = connections.get_mut(entry_id) else { return false };
        let now = Instant::now();
        if now.duration_since(conn.window_start) >= Duration::from_secs(1) {
            conn.window_start = now;
            conn.window_count = 0;
        }
        if conn.window_count >= self.settings.command_rate_limit_hz {
            return false;
        }
        conn.window_count += 1;
        true
    }

    /// Handle one parsed client message. Only the entry currently
    /// occupying the turn state machine (`ReadyPrompt` through
    /// `TurnEnd`) may issue commands; everyone else gets an `Error`.
    pub async fn dispatch(&self, entry_id: &str, msg: ControlClientMessage) {
        let Some(view) = self.view() else {
            tracing::warn!("control dispatch before turn view bound, dropping message");
            return;
        };
        if view.active_entry_id().await.as_deref() != Some(entry_id) {
            self.send_to_player(entry_id, ControlServerMessage::Error { message: "not your turn".into() }).await;
            return;
        }
        self.touch_activity(entry_id).await;

        match msg {
            ControlClientMessage::Auth { .. } => {
                self.send_to_player(entry_id, ControlServerMessage::Error { message: "already authenticated".into() })
                    .await;
            }
            ControlClientMessage::Keydown { key } => {
                // Rate-limited and dropped silently: held keys fire rapidly
                // and an `Error` reply per drop would itself flood the
                // socket. keyup/drop/ready all pass through unthrottled.
                if !self.check_rate_limit(entry_id).await {
                    return;
                }
                if view.current_state().await != GameState::Moving {
                    return;
                }
                let direction: Direction = key.into();
                match self.hardware.direction_on(direction).await {
                    Ok(active) => {
                        self.send_to_player(entry_id, ControlServerMessage::ControlAck { key, active }).await
                    }
                    Err(e) => tracing::warn!(error = %e, entry_id, ?direction, "direction_on failed"),
                }
            }
            ControlClientMessage::Keyup { key } => {
                if view.current_state().await != GameState::Moving {
                    return;
                }
                let direction: Direction = key.into();
                if let Err(e) = self.hardware.direction_off(direction).await {
                    tracing::warn!(error = %e, entry_id, ?direction, "direction_off failed");
                }
                self.send_to_player(entry_id, ControlServerMessage::ControlAck { key, active: false }).await;
            }
            ControlClientMessage::DropStart => view.handle_drop_press(entry_id).await,
            ControlClientMessage::DropEnd => view.handle_drop_release(entry_id).await,
            ControlClientMessage::ReadyConfirm => view.handle_ready_confirm(entry_id).await,
            ControlClientMessage::LatencyPing { sent_at_ms } => {
                self.send_to_player(entry_id, ControlServerMessage::LatencyPong { sent_at_ms }).await;
            }
        }
    }
}

#[async_trait::async_trait]
impl PlayerNotifier for ControlChannel {
    async fn send_to_player(&self, entry_id: &str, message: ControlServerMessage) {
        let connections = self.connections.lock().await;
        if let Some(conn) = connections.get(entry_id) {
            let _ = conn.tx.send(message);
        }
    }

    async fn is_player_connected(&self, entry_id: &str) -> bool {
        let connections = self.connections.lock().await;
        connections.get(entry_id).map(|c| c.connected).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ConflictMode, MockGate};
    use crate::queue::QueueManager;
    use crate::store::Store;
    use crate::turn::TurnStateMachine;

    async fn channel() -> (Arc<ControlChannel>, Arc<TurnStateMachine>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("claw.db")).unwrap());
        let queue = Arc::new(QueueManager::new(store));
        let fanout = Arc::new(crate::fanout::StatusFanout::new());
        let hardware = MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let settings = Arc::new(Settings { command_rate_limit_hz: 2, queue_grace_period_seconds: 1, ..Settings::default() });
        let control = ControlChannel::new(hardware.clone(), settings.clone());
        let sm = TurnStateMachine::new(hardware, queue, fanout, control.clone(), settings, None);
        control.bind_turn_view(sm.clone());
        (control, sm, dir)
    }

    #[tokio::test]
    async fn non_active_entry_is_rejected() {
        let (control, _sm, _dir) = channel().await;
        let mut rx = control.register("someone".to_string()).await;
        control.dispatch("someone", ControlClientMessage::ReadyConfirm).await;
        match rx.recv().await {
            Some(ControlServerMessage::Error { message }) => assert_eq!(message, "not your turn"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_commands_within_the_same_window() {
        let (control, _sm, _dir) = channel().await;
        let entry_id = "p1".to_string();
        let _rx = control.register(entry_id.clone()).await;
        assert!(control.check_rate_limit(&entry_id).await);
        assert!(control.check_rate_limit(&entry_id).await);
        assert!(!control.check_rate_limit(&entry_id).await);
    }

    #[tokio::test]
    async fn keydown_is_accepted_once_the_entry_is_the_active_player() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("claw.db")).unwrap());
        let queue = Arc::new(QueueManager::new(store));
        let fanout = Arc::new(crate::fanout::StatusFanout::new());
        let hardware = MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let settings = Arc::new(Settings { command_rate_limit_hz: 10, ..Settings::default() });
        let control = ControlChannel::new(hardware.clone(), settings.clone());
        let sm = TurnStateMachine::new(hardware, queue.clone(), fanout, control.clone(), settings, None);
        control.bind_turn_view(sm.clone());

        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let mut rx = control.register(joined.id.clone()).await;
        sm.advance_queue().await;
        control.dispatch(&joined.id, ControlClientMessage::ReadyConfirm).await;

        control.dispatch(&joined.id, ControlClientMessage::Keydown { key: protocol::Direction::North }).await;
        let mut saw_ack = false;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
            if matches!(msg, ControlServerMessage::ControlAck { active: true, .. }) {
                saw_ack = true;
                break;
            }
        }
        assert!(saw_ack);
    }

    #[tokio::test]
    async fn unregister_of_non_active_entry_releases_the_slot_immediately() {
        let (control, _sm, _dir) = channel().await;
        let entry_id = "p1".to_string();
        let _rx = control.register(entry_id.clone()).await;
        assert_eq!(control.connection_count(), 1);

        control.unregister(&entry_id).await;
        assert_eq!(control.connection_count(), 0, "non-active disconnect must release its slot, not leak it");
        assert!(!control.is_player_connected(&entry_id).await);

        let _rx2 = control.register(entry_id.clone()).await;
        assert_eq!(control.connection_count(), 1);
        assert!(control.is_player_connected(&entry_id).await);
    }

    #[tokio::test]
    async fn active_player_disconnect_mid_turn_starts_grace_and_reconnect_cancels_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("claw.db")).unwrap());
        let queue = Arc::new(QueueManager::new(store));
        let fanout = Arc::new(crate::fanout::StatusFanout::new());
        let hardware = MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let settings = Arc::new(Settings { queue_grace_period_seconds: 60, ..Settings::default() });
        let control = ControlChannel::new(hardware.clone(), settings.clone());
        let sm = TurnStateMachine::new(hardware, queue.clone(), fanout, control.clone(), settings, None);
        control.bind_turn_view(sm.clone());

        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let _rx = control.register(joined.id.clone()).await;
        sm.advance_queue().await;
        control.dispatch(&joined.id, ControlClientMessage::ReadyConfirm).await;
        assert_eq!(sm.state().await, GameState::Moving);

        control.unregister(&joined.id).await;
        // Mid-turn disconnect keeps the entry's bookkeeping alive for the
        // grace window rather than dropping it like a non-active entry.
        assert_eq!(control.connection_count(), 1);
        assert!(!control.is_player_connected(&joined.id).await);

        let _rx2 = control.register(joined.id.clone()).await;
        assert!(control.is_player_connected(&joined.id).await);
        assert_eq!(control.connection_count(), 1);
    }

    #[tokio::test]
    async fn keydown_is_ignored_during_ready_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("claw.db")).unwrap());
        let queue = Arc::new(QueueManager::new(store));
        let fanout = Arc::new(crate::fanout::StatusFanout::new());
        let hardware = MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let settings = Arc::new(Settings::default());
        let control = ControlChannel::new(hardware.clone(), settings.clone());
        let sm = TurnStateMachine::new(hardware, queue.clone(), fanout, control.clone(), settings, None);
        control.bind_turn_view(sm.clone());

        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let mut rx = control.register(joined.id.clone()).await;
        sm.advance_queue().await;
        assert_eq!(sm.state().await, GameState::ReadyPrompt);

        control.dispatch(&joined.id, ControlClientMessage::Keydown { key: protocol::Direction::North }).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn is_stale_reports_idle_connections() {
        let (control, _sm, _dir) = channel().await;
        let entry_id = "p1".to_string();
        let _rx = control.register(entry_id.clone()).await;
        assert!(!control.is_stale(&entry_id, Duration::from_secs(60)).await);
        assert!(control.is_stale(&entry_id, Duration::from_millis(0)).await);
    }
}
