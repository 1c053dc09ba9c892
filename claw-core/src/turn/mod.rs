//! Turn State Machine: owns who gets to play, drives the claw through one
//! turn's states, and is the only thing allowed to call
//! [`HardwareGate::emergency_stop`]/`unlock` on a state transition.
//!
//! Two locks, deliberately not one: `inner` guards every mutable field of
//! the state machine itself, while `advance_lock` separately guards
//! `advance_queue`'s candidate-selection loop. `end_turn` never calls
//! `advance_queue` inline — only via `schedule_advance`'s fire-and-forget
//! `tokio::spawn` — because `end_turn` is frequently invoked from a timer
//! callback that may itself be running while some other caller holds
//! `advance_lock`; calling back in synchronously would deadlock.
//!
//! `ControlChannel` and `TurnStateMachine` never depend on each other's
//! concrete type: each exposes a narrow trait (`ActiveTurnView` here,
//! `PlayerNotifier` in [`crate::control`]) that the other consumes through
//! an `Arc<dyn _>`, wired up after both are constructed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use protocol::{ControlServerMessage, GameState, StateUpdate, StatusServerMessage, TurnResult};

use crate::config::Settings;
use crate::fanout::StatusFanout;
use crate::hardware::{HardwareGate, PulseOutput};
use crate::queue::{EntryState, QueueManager};

/// What the control channel needs to drive and query the turn state
/// machine. Implemented by [`TurnStateMachine`]; consumed by
/// `crate::control::ControlChannel` as `Arc<dyn ActiveTurnView>`.
#[async_trait::async_trait]
pub trait ActiveTurnView: Send + Sync {
    async fn handle_ready_confirm(&self, entry_id: &str);
    async fn handle_drop_press(&self, entry_id: &str);
    async fn handle_drop_release(&self, entry_id: &str);
    async fn handle_disconnect(&self, entry_id: &str);
    async fn handle_disconnect_timeout(&self, entry_id: &str);
    async fn active_entry_id(&self) -> Option<String>;
    /// Full current-state snapshot, sent to a reconnecting active player.
    async fn snapshot(&self) -> StateUpdate;
    /// Current coarse game state, for callers that only need to gate on
    /// it (control command validation, disconnect-grace eligibility)
    /// without paying for a full [`StateUpdate`].
    async fn current_state(&self) -> GameState;
}

/// What the turn state machine needs from whatever owns the live control
/// sockets. Implemented by `crate::control::ControlChannel`.
#[async_trait::async_trait]
pub trait PlayerNotifier: Send + Sync {
    async fn send_to_player(&self, entry_id: &str, message: ControlServerMessage);
    async fn is_player_connected(&self, entry_id: &str) -> bool;
}

/// Fire-and-forget sink for ambient lighting events. `claw-core` never
/// speaks HTTP itself — `claw-server` supplies the real `reqwest`-backed
/// implementation; tests can supply nothing at all (`wled: None`).
#[async_trait::async_trait]
pub trait WledSink: Send + Sync {
    async fn on_event(&self, event: &str);
}

struct Inner {
    state: GameState,
    active_entry_id: Option<String>,
    active_player_name: Option<String>,
    current_try: u32,
    state_deadline: Option<Instant>,
    turn_deadline: Option<Instant>,
    state_timer: Option<tokio::task::JoinHandle<()>>,
    turn_timer: Option<tokio::task::JoinHandle<()>>,
}

pub struct TurnStateMachine {
    self_ref: Weak<TurnStateMachine>,
    hardware: Arc<dyn HardwareGate>,
    queue: Arc<QueueManager>,
    fanout: Arc<StatusFanout>,
    notifier: Arc<dyn PlayerNotifier>,
    settings: Arc<Settings>,
    wled: Option<Arc<dyn WledSink>>,
    inner: Mutex<Inner>,
    advance_lock: Mutex<()>,
    paused: AtomicBool,
    recovering: AtomicBool,
}

impl TurnStateMachine {
    pub fn new(
        hardware: Arc<dyn HardwareGate>,
        queue: Arc<QueueManager>,
        fanout: Arc<StatusFanout>,
        notifier: Arc<dyn PlayerNotifier>,
        settings: Arc<Settings>,
        wled: Option<Arc<dyn WledSink>>,
    ) -> Arc<TurnStateMachine> {
        Arc::new_cyclic(|self_ref| TurnStateMachine {
            self_ref: self_ref.clone(),
            hardware,
            queue,
            fanout,
            notifier,
            settings,
            wled,
            inner: Mutex::new(Inner {
                state: GameState::Idle,
                active_entry_id: None,
                active_player_name: None,
                current_try: 0,
                state_deadline: None,
                turn_deadline: None,
                state_timer: None,
                turn_timer: None,
            }),
            advance_lock: Mutex::new(()),
            paused: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
        })
    }

    /// Spawn the task that bridges the hardware win sensor (a raw,
    /// non-async channel fed from an interrupt thread) into `handle_win`.
    /// Called once by the supervisor at startup.
    pub fn spawn_win_bridge(sm: &Arc<TurnStateMachine>) {
        let this = Arc::clone(sm);
        let mut win_rx = this.hardware.win_events();
        tokio::spawn(async move {
            while win_rx.recv().await.is_some() {
                this.handle_win().await;
            }
            tracing::warn!("win sensor channel closed, bridge task exiting");
        });
    }

    fn self_arc(&self) -> Arc<TurnStateMachine> {
        self.self_ref.upgrade().expect("turn state machine used after being dropped")
    }

    pub async fn state(&self) -> GameState {
        self.inner.lock().await.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("turn state machine paused: no new promotions until resumed");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        tracing::info!("turn state machine resumed");
        self.schedule_advance();
    }

    /// Promote the next eligible queue entry to READY_PROMPT, skipping
    /// ghost entries that have been waiting disconnected past
    /// `ghost_player_age_s`. No-op if paused, empty, or already mid-turn.
    pub async fn advance_queue(&self) {
        if self.paused.load(Ordering::SeqCst) {
            return;
        }

        // Give a just-promoted candidate a moment to open its control
        // socket before the ghost check below judges it, entirely outside
        // `advance_lock` so a slow connect never blocks other callers.
        if let Ok(Some(candidate)) = self.queue.peek_next_waiting().await {
            if !self.notifier.is_player_connected(&candidate.id).await {
                tokio::time::sleep(Duration::from_millis(2000)).await;
            }
        }

        let _advance_guard = self.advance_lock.lock().await;

        loop {
            let candidate = match self.queue.peek_next_waiting().await {
                Ok(Some(c)) => c,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "advance_queue: failed to read next waiting entry");
                    return;
                }
            };

            if !self.notifier.is_player_connected(&candidate.id).await {
                let age_seconds = chrono::DateTime::parse_from_rfc3339(&candidate.created_at)
                    .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds().max(0) as u64)
                    .unwrap_or(0);
                if age_seconds > self.settings.ghost_player_age_s {
                    tracing::info!(entry_id = %candidate.id, age_seconds, "skipping ghost player, no connection");
                    if let Err(e) = self.queue.complete_entry(candidate.id.clone(), "skipped", 0).await {
                        tracing::warn!(error = %e, "failed to mark ghost player skipped");
                    }
                    self.fanout
                        .broadcast(StatusServerMessage::TurnEnd {
                            entry_id: candidate.id.clone(),
                            result: TurnResult::Skipped,
                            tries_used: 0,
                        })
                        .await;
                    self.fanout.broadcast(StatusServerMessage::QueueUpdate(self.queue_status_wire().await)).await;
                    continue;
                }
            }

            let mut inner = self.inner.lock().await;
            if inner.state != GameState::Idle {
                return;
            }
            inner.active_entry_id = Some(candidate.id.clone());
            inner.active_player_name = Some(candidate.name.clone());

            if let Err(e) = self.queue.set_state(candidate.id.clone(), EntryState::Ready).await {
                tracing::warn!(error = %e, "failed to promote candidate to ready");
            }
            self.fanout.broadcast(StatusServerMessage::QueueUpdate(self.queue_status_wire().await)).await;

            self.enter_state(&mut inner, GameState::ReadyPrompt).await;
            return;
        }
    }

    async fn handle_ready_confirm_inner(&self, entry_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::ReadyPrompt || inner.active_entry_id.as_deref() != Some(entry_id) {
            return;
        }
        if let Err(e) = self.queue.set_state(entry_id.to_string(), EntryState::Active).await {
            tracing::warn!(error = %e, "failed to mark entry active on ready confirm");
        }
        inner.current_try = 0;

        let deadline = Instant::now() + Duration::from_secs(self.settings.turn_time_seconds);
        inner.turn_deadline = Some(deadline);
        if let Some(h) = inner.turn_timer.take() {
            h.abort();
        }
        let expected_entry = inner.active_entry_id.clone();
        let this = self.self_arc();
        inner.turn_timer = Some(tokio::spawn(async move {
            this.hard_turn_timeout(expected_entry, deadline).await;
        }));
        self.persist_deadlines(&inner).await;

        self.start_try(&mut inner).await;
    }

    async fn handle_drop_press_inner(&self, entry_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::Moving || inner.active_entry_id.as_deref() != Some(entry_id) {
            return;
        }
        self.enter_state(&mut inner, GameState::Dropping).await;
    }

    async fn handle_drop_release_inner(&self, entry_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::Dropping || inner.active_entry_id.as_deref() != Some(entry_id) {
            return;
        }
        if let Some(h) = inner.state_timer.take() {
            h.abort();
        }
        if let Err(e) = self.hardware.drop_off().await {
            tracing::warn!(error = %e, "drop_off failed on drop_end");
        }
        self.enter_state(&mut inner, GameState::PostDrop).await;
    }

    /// Win sensor edge, bridged in from the hardware callback thread. A
    /// no-op outside DROPPING/POST_DROP — a bounce, or a sensor firing
    /// while nobody's turn is active, is not a win.
    pub async fn handle_win(&self) {
        if !self.settings.win_sensor_enabled {
            return;
        }
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, GameState::Dropping | GameState::PostDrop) {
            self.end_turn(&mut inner, TurnResult::Win).await;
        } else {
            tracing::warn!(state = ?inner.state, "win sensor fired outside dropping/post_drop, ignored");
        }
    }

    async fn handle_disconnect_inner(&self, entry_id: &str) {
        if let Err(e) = self.hardware.all_directions_off().await {
            tracing::warn!(error = %e, entry_id, "all_directions_off failed on disconnect");
        }
        tracing::info!(entry_id, "control connection disconnected");
    }

    async fn handle_disconnect_timeout_inner(&self, entry_id: &str) {
        let mut inner = self.inner.lock().await;
        if inner.active_entry_id.as_deref() == Some(entry_id) {
            self.end_turn(&mut inner, TurnResult::Expired).await;
        }
    }

    /// Admin-driven forced end of the active turn. Handles the special
    /// case where the machine is already IDLE/TURN_END but the queue entry
    /// is still marked active (the ordinary `end_turn` path would no-op)
    /// by cleaning up the entry directly instead.
    pub async fn force_end_turn(&self, result: TurnResult) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, GameState::Idle | GameState::TurnEnd) {
            let Some(entry_id) = inner.active_entry_id.clone() else { return };
            if let Err(e) = self.queue.complete_entry(entry_id, result_db_str(result), inner.current_try).await {
                tracing::warn!(error = %e, "failed to persist forced turn completion");
            }
            self.hardware.unlock().await;
            self.reset_to_idle(&mut inner);
            self.broadcast_state(&inner).await;
            self.schedule_advance();
            return;
        }
        self.end_turn(&mut inner, result).await;
    }

    /// Stuck-state recovery: cancel any pending timers, force the hardware
    /// safe, mark the entry errored if one is still active, and reset to
    /// IDLE. Guarded against concurrent invocation (the supervisor's
    /// periodic check and a late timer callback can both decide recovery
    /// is needed at once).
    pub async fn force_recover(&self) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.state != GameState::Idle || inner.active_entry_id.is_some() {
            if let Some(h) = inner.turn_timer.take() {
                h.abort();
            }
            if let Some(h) = inner.state_timer.take() {
                h.abort();
            }

            match tokio::time::timeout(
                Duration::from_secs(self.settings.emergency_stop_timeout_s),
                self.hardware.emergency_stop(),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "emergency_stop failed during force_recover"),
                Err(_) => tracing::warn!("emergency_stop timed out during force_recover"),
            }
            self.hardware.unlock().await;

            if let Some(entry_id) = inner.active_entry_id.clone() {
                if let Err(e) = self.queue.complete_entry(entry_id, "error", inner.current_try).await {
                    tracing::warn!(error = %e, "failed to persist errored turn during force_recover");
                }
            }

            self.reset_to_idle(&mut inner);
            self.broadcast_state(&inner).await;
        }
        drop(inner);

        self.recovering.store(false, Ordering::SeqCst);
        self.schedule_advance();
    }

    fn reset_to_idle(&self, inner: &mut Inner) {
        inner.state = GameState::Idle;
        inner.active_entry_id = None;
        inner.active_player_name = None;
        inner.current_try = 0;
        inner.state_deadline = None;
        inner.turn_deadline = None;
    }

    fn schedule_advance(&self) {
        let this = self.self_arc();
        tokio::spawn(async move {
            this.advance_queue().await;
        });
    }

    async fn start_try(&self, inner: &mut Inner) {
        inner.current_try += 1;
        if self.settings.coin_each_try {
            for _ in 0..self.settings.coin_pulses_per_credit {
                if let Err(e) = self.hardware.pulse(PulseOutput::Coin).await {
                    tracing::warn!(error = %e, "coin pulse failed");
                }
                if self.settings.coin_post_pulse_delay_s > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(self.settings.coin_post_pulse_delay_s)).await;
                }
            }
        }
        if inner.current_try == 1 {
            self.wled_event("start_turn").await;
        }
        self.enter_state(inner, GameState::Moving).await;
    }

    async fn enter_state(&self, inner: &mut Inner, new_state: GameState) {
        if let Some(h) = inner.state_timer.take() {
            h.abort();
        }
        inner.state = new_state;
        inner.state_deadline = None;

        match new_state {
            GameState::ReadyPrompt => {
                let deadline = Instant::now() + Duration::from_secs(self.settings.ready_prompt_seconds);
                inner.state_deadline = Some(deadline);
                let expected_entry = inner.active_entry_id.clone();
                let this = self.self_arc();
                inner.state_timer = Some(tokio::spawn(async move {
                    this.ready_timeout(expected_entry, deadline).await;
                }));
            }
            GameState::Moving => {
                let deadline = Instant::now() + Duration::from_secs(self.settings.try_move_seconds);
                inner.state_deadline = Some(deadline);
                let expected_entry = inner.active_entry_id.clone();
                let this = self.self_arc();
                inner.state_timer = Some(tokio::spawn(async move {
                    this.move_timeout(expected_entry, deadline).await;
                }));
                self.persist_deadlines(inner).await;
            }
            GameState::Dropping => {
                if let Err(e) = self.hardware.all_directions_off().await {
                    tracing::warn!(error = %e, "all_directions_off failed entering dropping");
                }
                if let Err(e) = self.hardware.drop_on().await {
                    tracing::warn!(error = %e, "drop_on failed");
                }
                let deadline = Instant::now() + Duration::from_millis(self.settings.drop_hold_max_ms);
                inner.state_deadline = Some(deadline);
                let expected_entry = inner.active_entry_id.clone();
                let this = self.self_arc();
                inner.state_timer = Some(tokio::spawn(async move {
                    this.drop_hold_timeout(expected_entry, deadline).await;
                }));
                self.wled_event("drop").await;
            }
            GameState::PostDrop => {
                let wait = if self.settings.win_sensor_enabled {
                    Duration::from_secs(self.settings.post_drop_wait_seconds)
                } else {
                    Duration::from_secs(1)
                };
                let deadline = Instant::now() + wait;
                inner.state_deadline = Some(deadline);
                let expected_entry = inner.active_entry_id.clone();
                let this = self.self_arc();
                inner.state_timer = Some(tokio::spawn(async move {
                    this.post_drop_timeout(expected_entry, deadline).await;
                }));
            }
            GameState::TurnEnd | GameState::Idle => {}
        }

        self.broadcast_state(inner).await;
    }

    /// Reentrancy-safe turn teardown. Setting `state = TURN_END`
    /// synchronously, before any `await`, means a timer that fires
    /// concurrently (already past its own re-check) sees the terminal
    /// state on its next lock acquisition and no-ops instead of double
    /// ending the turn.
    async fn end_turn(&self, inner: &mut Inner, result: TurnResult) {
        if matches!(inner.state, GameState::Idle | GameState::TurnEnd) {
            return;
        }
        let prev_state = inner.state;
        inner.state = GameState::TurnEnd;

        if let Some(h) = inner.turn_timer.take() {
            h.abort();
        }
        if let Some(h) = inner.state_timer.take() {
            h.abort();
        }

        if prev_state == GameState::Dropping {
            if let Err(e) = self.hardware.drop_off().await {
                tracing::warn!(error = %e, "drop_off failed during end_turn cleanup");
            }
        }

        match tokio::time::timeout(
            Duration::from_secs(self.settings.emergency_stop_timeout_s),
            self.hardware.emergency_stop(),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "emergency_stop failed during end_turn"),
            Err(_) => tracing::warn!("emergency_stop timed out during end_turn"),
        }
        // Unconditional: whatever happened above, the next player must not
        // inherit a locked gate.
        self.hardware.unlock().await;

        let current_try = inner.current_try;
        if let Some(entry_id) = inner.active_entry_id.clone() {
            if let Err(e) = self.queue.complete_entry(entry_id.clone(), result_db_str(result), current_try).await {
                tracing::warn!(error = %e, "failed to persist turn completion");
            }
            self.fanout
                .broadcast(StatusServerMessage::TurnEnd { entry_id: entry_id.clone(), result, tries_used: current_try })
                .await;
            self.notifier
                .send_to_player(&entry_id, ControlServerMessage::TurnEnd { result, tries_used: current_try })
                .await;
            self.fanout.broadcast(StatusServerMessage::QueueUpdate(self.queue_status_wire().await)).await;
        }

        if let Some(event) = wled_event_for_result(result) {
            self.wled_event(event).await;
        }

        self.reset_to_idle(inner);
        self.wled_event("idle").await;
        self.broadcast_state(inner).await;

        self.schedule_advance();
    }

    async fn ready_timeout(self: Arc<Self>, expected_entry: Option<String>, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::ReadyPrompt || inner.active_entry_id != expected_entry {
            return;
        }
        inner.state_timer = None;
        self.end_turn(&mut inner, TurnResult::Skipped).await;
    }

    async fn move_timeout(self: Arc<Self>, expected_entry: Option<String>, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::Moving || inner.active_entry_id != expected_entry {
            return;
        }
        inner.state_timer = None;
        tracing::info!(entry_id = ?expected_entry, "move window elapsed, forcing drop");
        self.enter_state(&mut inner, GameState::Dropping).await;
    }

    async fn drop_hold_timeout(self: Arc<Self>, expected_entry: Option<String>, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::Dropping || inner.active_entry_id != expected_entry {
            return;
        }
        inner.state_timer = None;
        tracing::warn!(entry_id = ?expected_entry, "drop hold safety timeout, auto-releasing");
        if let Err(e) = self.hardware.drop_off().await {
            tracing::warn!(error = %e, "drop_off failed on safety timeout");
        }
        self.enter_state(&mut inner, GameState::PostDrop).await;
    }

    async fn post_drop_timeout(self: Arc<Self>, expected_entry: Option<String>, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
        let mut inner = self.inner.lock().await;
        if inner.state != GameState::PostDrop || inner.active_entry_id != expected_entry {
            return;
        }
        inner.state_timer = None;
        if inner.current_try < self.settings.tries_per_player {
            self.start_try(&mut inner).await;
        } else {
            self.end_turn(&mut inner, TurnResult::Loss).await;
        }
    }

    async fn hard_turn_timeout(self: Arc<Self>, expected_entry: Option<String>, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
        let mut inner = self.inner.lock().await;
        if inner.active_entry_id != expected_entry || matches!(inner.state, GameState::Idle | GameState::TurnEnd) {
            return;
        }
        inner.turn_timer = None;
        self.end_turn(&mut inner, TurnResult::Expired).await;
    }

    fn build_state_payload(&self, inner: &Inner) -> StateUpdate {
        let now = Instant::now();
        let deadline_ms = inner.state_deadline.map(|d| d.saturating_duration_since(now).as_millis() as u64);
        StateUpdate {
            game_state: inner.state,
            active_entry_id: inner.active_entry_id.clone(),
            active_player_name: inner.active_player_name.clone(),
            current_try: inner.current_try,
            tries_per_player: self.settings.tries_per_player,
            deadline_ms,
        }
    }

    async fn broadcast_state(&self, inner: &Inner) {
        let payload = self.build_state_payload(inner);
        self.fanout.broadcast(StatusServerMessage::StateUpdate(payload.clone())).await;
        if let Some(entry_id) = inner.active_entry_id.clone() {
            self.notifier.send_to_player(&entry_id, ControlServerMessage::StateUpdate(payload.clone())).await;
            if inner.state == GameState::ReadyPrompt {
                self.notifier
                    .send_to_player(
                        &entry_id,
                        ControlServerMessage::ReadyPrompt { timeout_seconds: self.settings.ready_prompt_seconds as u32 },
                    )
                    .await;
            }
        }
    }

    /// Persist absolute wall-clock deadlines for restart recovery. Never
    /// read back for live timing — the monotonic `Instant`s in `Inner`
    /// remain authoritative for as long as the process stays up.
    async fn persist_deadlines(&self, inner: &Inner) {
        let Some(entry_id) = inner.active_entry_id.clone() else { return };
        let now_instant = Instant::now();
        let now_utc = chrono::Utc::now();
        let to_absolute = |deadline: Instant| {
            let delta = deadline.saturating_duration_since(now_instant);
            now_utc + chrono::Duration::from_std(delta).unwrap_or_default()
        };
        let try_move_end_at = inner.state_deadline.map(to_absolute);
        let turn_end_at = inner.turn_deadline.map(to_absolute);
        if let Err(e) = self.queue.write_deadlines(entry_id, try_move_end_at, turn_end_at).await {
            tracing::warn!(error = %e, "failed to persist turn deadlines");
        }
    }

    async fn wled_event(&self, event: &str) {
        if let Some(wled) = &self.wled {
            wled.on_event(event).await;
        }
    }

    async fn queue_status_wire(&self) -> protocol::QueueStatus {
        match self.queue.get_queue_status().await {
            Ok(s) => protocol::QueueStatus {
                current_player: s.current_player,
                current_player_state: s.current_player_state,
                queue_length: s.queue_length.max(0) as u32,
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read queue status for broadcast");
                protocol::QueueStatus { current_player: None, current_player_state: None, queue_length: 0 }
            }
        }
    }
}

#[async_trait::async_trait]
impl ActiveTurnView for TurnStateMachine {
    async fn handle_ready_confirm(&self, entry_id: &str) {
        self.handle_ready_confirm_inner(entry_id).await
    }

    async fn handle_drop_press(&self, entry_id: &str) {
        self.handle_drop_press_inner(entry_id).await
    }

    async fn handle_drop_release(&self, entry_id: &str) {
        self.handle_drop_release_inner(entry_id).await
    }

    async fn handle_disconnect(&self, entry_id: &str) {
        self.handle_disconnect_inner(entry_id).await
    }

    async fn handle_disconnect_timeout(&self, entry_id: &str) {
        self.handle_disconnect_timeout_inner(entry_id).await
    }

    async fn active_entry_id(&self) -> Option<String> {
        self.inner.lock().await.active_entry_id.clone()
    }

    async fn snapshot(&self) -> StateUpdate {
        let inner = self.inner.lock().await;
        self.build_state_payload(&inner)
    }

    async fn current_state(&self) -> GameState {
        self.state().await
    }
}

fn result_db_str(result: TurnResult) -> &'static str {
    match result {
        TurnResult::Win => "win",
        TurnResult::Loss => "loss",
        TurnResult::Skipped => "skipped",
        TurnResult::Expired => "expired",
        TurnResult::AdminSkipped => "admin_skipped",
        TurnResult::Cancelled => "cancelled",
        TurnResult::Error => "error",
    }
}

fn wled_event_for_result(result: TurnResult) -> Option<&'static str> {
    match result {
        TurnResult::Win => Some("win"),
        TurnResult::Loss => Some("loss"),
        TurnResult::Expired => Some("expire"),
        TurnResult::Skipped | TurnResult::AdminSkipped | TurnResult::Cancelled | TurnResult::Error => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ConflictMode, MockGate};
    use crate::store::Store;

    struct NullNotifier;

    #[async_trait::async_trait]
    impl PlayerNotifier for NullNotifier {
        async fn send_to_player(&self, _entry_id: &str, _message: ControlServerMessage) {}
        async fn is_player_connected(&self, _entry_id: &str) -> bool {
            true
        }
    }

    async fn harness() -> (Arc<TurnStateMachine>, Arc<QueueManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("claw.db")).unwrap());
        let queue = Arc::new(QueueManager::new(store));
        let fanout = Arc::new(StatusFanout::new());
        let hardware = MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let settings = Arc::new(Settings {
            ready_prompt_seconds: 1,
            try_move_seconds: 1,
            post_drop_wait_seconds: 1,
            turn_time_seconds: 10,
            drop_hold_max_ms: 500,
            tries_per_player: 2,
            ..Settings::default()
        });
        let sm = TurnStateMachine::new(hardware, queue.clone(), fanout, Arc::new(NullNotifier), settings, None);
        (sm, queue, dir)
    }

    #[tokio::test]
    async fn advance_queue_is_idempotent_when_empty() {
        let (sm, _queue, _dir) = harness().await;
        sm.advance_queue().await;
        assert_eq!(sm.state().await, GameState::Idle);
        sm.advance_queue().await;
        assert_eq!(sm.state().await, GameState::Idle);
    }

    #[tokio::test]
    async fn full_happy_path_loss_after_max_tries() {
        let (sm, queue, _dir) = harness().await;
        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        sm.advance_queue().await;
        assert_eq!(sm.state().await, GameState::ReadyPrompt);

        sm.handle_ready_confirm(&joined.id).await;
        assert_eq!(sm.state().await, GameState::Moving);

        sm.handle_drop_press(&joined.id).await;
        assert_eq!(sm.state().await, GameState::Dropping);

        sm.handle_drop_release(&joined.id).await;
        assert_eq!(sm.state().await, GameState::PostDrop);

        // First post-drop timeout with no win: second try begins.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(sm.state().await, GameState::Moving);

        sm.handle_drop_press(&joined.id).await;
        sm.handle_drop_release(&joined.id).await;
        // Second post-drop timeout with no win and tries exhausted: loss.
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let entry = queue.get_by_id(joined.id).await.unwrap().unwrap();
        assert_eq!(entry.result.as_deref(), Some("loss"));
        assert_eq!(sm.state().await, GameState::Idle);
    }

    #[tokio::test]
    async fn win_during_dropping_ends_turn_as_win() {
        let (sm, queue, _dir) = harness().await;
        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        sm.advance_queue().await;
        sm.handle_ready_confirm(&joined.id).await;
        sm.handle_drop_press(&joined.id).await;
        assert_eq!(sm.state().await, GameState::Dropping);

        sm.handle_win().await;

        let entry = queue.get_by_id(joined.id).await.unwrap().unwrap();
        assert_eq!(entry.result.as_deref(), Some("win"));
        assert_eq!(sm.state().await, GameState::Idle);
    }

    #[tokio::test]
    async fn win_outside_dropping_is_ignored() {
        let (sm, _queue, _dir) = harness().await;
        sm.handle_win().await;
        assert_eq!(sm.state().await, GameState::Idle);
    }

    #[tokio::test]
    async fn ready_prompt_timeout_skips_player() {
        let (sm, queue, _dir) = harness().await;
        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        sm.advance_queue().await;
        assert_eq!(sm.state().await, GameState::ReadyPrompt);

        tokio::time::sleep(Duration::from_millis(1200)).await;

        let entry = queue.get_by_id(joined.id).await.unwrap().unwrap();
        assert_eq!(entry.result.as_deref(), Some("skipped"));
        assert_eq!(sm.state().await, GameState::Idle);
    }

    #[tokio::test]
    async fn concurrent_end_turn_calls_produce_exactly_one_completion() {
        let (sm, queue, _dir) = harness().await;
        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        sm.advance_queue().await;
        sm.handle_ready_confirm(&joined.id).await;

        let a = sm.clone();
        let b = sm.clone();
        let id_a = joined.id.clone();
        let id_b = joined.id.clone();
        let (r1, r2) = tokio::join!(
            async move { a.handle_disconnect_timeout(&id_a).await },
            async move { b.handle_disconnect_timeout(&id_b).await },
        );
        let _ = (r1, r2);

        let entry = queue.get_by_id(joined.id).await.unwrap().unwrap();
        assert_eq!(entry.result.as_deref(), Some("expired"));
        assert_eq!(entry.tries_used, 1);
    }

    #[tokio::test]
    async fn force_recover_resets_stuck_non_idle_state() {
        let (sm, queue, _dir) = harness().await;
        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        sm.advance_queue().await;
        sm.handle_ready_confirm(&joined.id).await;
        assert_eq!(sm.state().await, GameState::Moving);

        sm.force_recover().await;

        assert_eq!(sm.state().await, GameState::Idle);
        let entry = queue.get_by_id(joined.id).await.unwrap().unwrap();
        assert_eq!(entry.result.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn pause_blocks_new_promotions_but_resume_allows_them() {
        let (sm, queue, _dir) = harness().await;
        sm.pause();
        let joined = queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        sm.advance_queue().await;
        assert_eq!(sm.state().await, GameState::Idle);

        sm.resume();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sm.state().await, GameState::ReadyPrompt);
        let entry = queue.get_by_id(joined.id).await.unwrap().unwrap();
        assert_eq!(entry.state, EntryState::Ready);
    }
}
