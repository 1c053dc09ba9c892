//! Supervisor: owns construction order and the background tasks that keep
//! the system healthy without a human watching it.
//!
//! Construction order matters because of the circular dependency between
//! [`ControlChannel`] and [`TurnStateMachine`]: the control channel is
//! built first (it needs no reference to the state machine yet), the
//! state machine is built holding the control channel as its
//! [`PlayerNotifier`], and only then is the control channel handed the
//! state machine back as an [`ActiveTurnView`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::control::ControlChannel;
use crate::error::CoreResult;
use crate::fanout::StatusFanout;
use crate::hardware::HardwareGate;
use crate::queue::QueueManager;
use crate::ratelimit::RateLimiter;
use crate::store::Store;
use crate::turn::{ActiveTurnView, PlayerNotifier, TurnStateMachine, WledSink};

pub struct Supervisor {
    pub settings: Arc<Settings>,
    pub store: Arc<Store>,
    pub queue: Arc<QueueManager>,
    pub hardware: Arc<dyn HardwareGate>,
    pub fanout: Arc<StatusFanout>,
    pub control: Arc<ControlChannel>,
    pub turn: Arc<TurnStateMachine>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl Supervisor {
    /// Build every subsystem, wire the circular control/turn dependency,
    /// reconcile whatever the database says survived the last run, and
    /// kick off the background tasks. The returned supervisor is ready to
    /// be handed to `claw-server`'s route handlers.
    pub async fn start(
        settings: Arc<Settings>,
        hardware: Arc<dyn HardwareGate>,
        wled: Option<Arc<dyn WledSink>>,
    ) -> CoreResult<Arc<Supervisor>> {
        let store = Arc::new(Store::open(&settings.database_path)?);
        let queue = Arc::new(QueueManager::new(store.clone()));
        let fanout = Arc::new(StatusFanout::new());
        let rate_limiter = Arc::new(RateLimiter::new(store.clone()));

        let control = ControlChannel::new(hardware.clone(), settings.clone());
        let turn = TurnStateMachine::new(
            hardware.clone(),
            queue.clone(),
            fanout.clone(),
            control.clone() as Arc<dyn PlayerNotifier>,
            settings.clone(),
            wled,
        );
        control.bind_turn_view(turn.clone() as Arc<dyn ActiveTurnView>);
        TurnStateMachine::spawn_win_bridge(&turn);

        queue.cleanup_stale(settings.queue_grace_period_seconds).await?;
        if settings.is_insecure_default() {
            tracing::warn!("admin_api_key is still the default value, set a real one before exposing /admin");
        }

        let supervisor = Arc::new(Supervisor { settings, store, queue, hardware, fanout, control, turn, rate_limiter });
        supervisor.spawn_retention_prune();
        supervisor.spawn_rate_limit_sweep();
        supervisor.spawn_stale_reconciler();
        supervisor.turn.advance_queue().await;

        Ok(supervisor)
    }

    /// Periodic DB housekeeping: drop terminal queue entries (and their
    /// events) older than `db_retention_hours`, and `rate_limit_hits` rows
    /// older than the same window. Runs hourly, same "fallback solution,
    /// things should be handled internally otherwise" spirit as any other
    /// periodic reconciliation — it only ever deletes what normal
    /// completion already finished with.
    fn spawn_retention_prune(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                match this.store.prune_old_entries(this.settings.db_retention_hours).await {
                    Ok(deleted) if deleted > 0 => tracing::info!(deleted, "pruned old queue entries"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "retention prune failed"),
                }
                match this.store.prune_old_rate_limit_hits(this.settings.db_retention_hours).await {
                    Ok(deleted) if deleted > 0 => tracing::info!(deleted, "pruned old rate limit hits"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "rate limit hits prune failed"),
                }
            }
        });
    }

    /// Periodic in-memory rate limiter GC. Independent of the durable
    /// side's own sweep in `spawn_retention_prune` — this one only keeps
    /// the in-process window bounded and never touches the database.
    fn spawn_rate_limit_sweep(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(900));
            loop {
                interval.tick().await;
                this.rate_limiter.sweep_memory(Duration::from_secs(3600)).await;
            }
        });
    }

    /// Fallback reconciliation for a crash mid-turn. `cleanup_stale` at
    /// startup already catches entries whose grace period has fully
    /// elapsed; this tick re-runs the same check periodically and, if the
    /// turn state machine is idle with players waiting, nudges
    /// `advance_queue` in case a `schedule_advance` task was ever lost
    /// (e.g. to a panic) without anything else noticing.
    fn spawn_stale_reconciler(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = this.queue.cleanup_stale(this.settings.queue_grace_period_seconds).await {
                    tracing::warn!(error = %e, "periodic stale cleanup failed");
                }
                if this.turn.state().await == protocol::GameState::Idle && !this.turn.is_paused() {
                    this.turn.advance_queue().await;
                }
            }
        });
    }

    /// Graceful shutdown: stop accepting new promotions and force the
    /// hardware safe. Does not wait for an in-progress turn to finish —
    /// callers that need that should check `turn.state()` first.
    pub async fn shutdown(&self) {
        self.turn.pause();
        if let Err(e) = self.hardware.emergency_stop().await {
            tracing::warn!(error = %e, "emergency_stop failed during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ConflictMode, MockGate};

    #[tokio::test]
    async fn start_promotes_a_waiting_player_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings {
            database_path: dir.path().join("claw.db").to_string_lossy().to_string(),
            ..Settings::default()
        });
        let hardware = MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let supervisor = Supervisor::start(settings, hardware, None).await.unwrap();
        let joined = supervisor.queue.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        supervisor.turn.advance_queue().await;
        let entry = supervisor.queue.get_by_id(joined.id).await.unwrap().unwrap();
        assert_eq!(entry.state, crate::queue::EntryState::Ready);
    }

    #[tokio::test]
    async fn shutdown_pauses_promotions() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings {
            database_path: dir.path().join("claw.db").to_string_lossy().to_string(),
            ..Settings::default()
        });
        let hardware = MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let supervisor = Supervisor::start(settings, hardware, None).await.unwrap();
        supervisor.shutdown().await;
        assert!(supervisor.turn.is_paused());
    }
}
