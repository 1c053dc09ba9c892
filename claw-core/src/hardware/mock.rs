//! Software-only hardware gate. Logs every operation instead of touching a
//! pin, so the whole stack runs on a development machine with no Pi
//! attached. This is also what the test suite exercises.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{reject_if_locked, Direction, HardwareGate, LockFlag, PulseOutput};
use crate::error::CoreResult;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    IgnoreNew,
    Replace,
}

struct Inner {
    holds: HashMap<Direction, JoinHandle<()>>,
    last_pulse: HashMap<PulseOutput, Instant>,
}

pub struct MockGate {
    self_ref: Weak<MockGate>,
    inner: Mutex<Inner>,
    lock: LockFlag,
    conflict_mode: ConflictMode,
    direction_hold_max: Duration,
    min_inter_pulse: Duration,
    coin_pulse: Duration,
    drop_pulse: Duration,
    win_tx: mpsc::UnboundedSender<()>,
    win_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl MockGate {
    pub fn new(
        conflict_mode: ConflictMode,
        direction_hold_max: Duration,
        min_inter_pulse: Duration,
        coin_pulse: Duration,
        drop_pulse: Duration,
    ) -> Arc<MockGate> {
        let (win_tx, win_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|self_ref| MockGate {
            self_ref: self_ref.clone(),
            inner: Mutex::new(Inner { holds: HashMap::new(), last_pulse: HashMap::new() }),
            lock: LockFlag::new(),
            conflict_mode,
            direction_hold_max,
            min_inter_pulse,
            coin_pulse,
            drop_pulse,
            win_tx,
            win_rx: Mutex::new(Some(win_rx)),
        })
    }

    /// Test/debug helper — fire a synthetic win trigger as if the sensor
    /// fired right now.
    pub fn trigger_win(&self) {
        let _ = self.win_tx.send(());
    }

    async fn cancel_hold(&self, direction: Direction) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.holds.remove(&direction) {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl HardwareGate for MockGate {
    async fn direction_on(&self, direction: Direction) -> CoreResult<bool> {
        if self.lock.get() {
            return Ok(false);
        }
        let opposite = direction.opposite();
        {
            let inner = self.inner.lock().await;
            if inner.holds.contains_key(&opposite) {
                if self.conflict_mode == ConflictMode::IgnoreNew {
                    return Ok(false);
                }
            }
            if inner.holds.contains_key(&direction) {
                return Ok(true);
            }
        }
        if self.conflict_mode == ConflictMode::Replace {
            self.direction_off(opposite).await?;
        }

        tracing::debug!(?direction, "direction ON (mock)");
        let hold_max = self.direction_hold_max;
        let weak = self.self_ref.clone();
        let mut inner = self.inner.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(hold_max).await;
            tracing::warn!(?direction, "hold timeout reached (mock), auto-releasing");
            if let Some(gate) = weak.upgrade() {
                let _ = gate.direction_off(direction).await;
            }
        });
        inner.holds.insert(direction, handle);
        Ok(true)
    }

    async fn direction_off(&self, direction: Direction) -> CoreResult<bool> {
        self.cancel_hold(direction).await;
        tracing::debug!(?direction, "direction OFF (mock)");
        Ok(true)
    }

    async fn all_directions_off(&self) -> CoreResult<()> {
        let directions: Vec<Direction> = {
            let inner = self.inner.lock().await;
            inner.holds.keys().copied().collect()
        };
        for d in directions {
            self.direction_off(d).await?;
        }
        Ok(())
    }

    async fn drop_on(&self) -> CoreResult<()> {
        reject_if_locked(self.lock.get())?;
        tracing::debug!("drop relay ON (mock)");
        Ok(())
    }

    async fn drop_off(&self) -> CoreResult<()> {
        tracing::debug!("drop relay OFF (mock)");
        Ok(())
    }

    async fn pulse(&self, output: PulseOutput) -> CoreResult<bool> {
        if self.lock.get() {
            return Ok(false);
        }
        let now = Instant::now();
        let cooldown_ok = {
            let inner = self.inner.lock().await;
            match inner.last_pulse.get(&output) {
                Some(last) => now.duration_since(*last) >= self.min_inter_pulse,
                None => true,
            }
        };
        if !cooldown_ok {
            return Ok(false);
        }
        let duration = match output {
            PulseOutput::Coin => self.coin_pulse,
            PulseOutput::Drop => self.drop_pulse,
        };
        {
            let mut inner = self.inner.lock().await;
            inner.last_pulse.insert(output, now);
        }
        tracing::info!(?output, ms = duration.as_millis(), "pulse (mock)");
        Ok(true)
    }

    async fn emergency_stop(&self) -> CoreResult<()> {
        self.lock.set(true);
        let directions: Vec<Direction> = {
            let mut inner = self.inner.lock().await;
            let keys: Vec<Direction> = inner.holds.keys().copied().collect();
            for handle in inner.holds.values() {
                handle.abort();
            }
            inner.holds.clear();
            keys
        };
        tracing::warn!(?directions, "EMERGENCY STOP (mock): all outputs off");
        Ok(())
    }

    async fn unlock(&self) {
        self.lock.set(false);
    }

    fn is_locked(&self) -> bool {
        self.lock.get()
    }

    fn win_events(&self) -> mpsc::UnboundedReceiver<()> {
        let mut guard = self.win_rx.try_lock().expect("win_events taken more than once");
        guard.take().expect("win_events taken more than once")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> Arc<MockGate> {
        MockGate::new(
            ConflictMode::IgnoreNew,
            Duration::from_secs(30),
            Duration::from_millis(500),
            Duration::from_millis(150),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn opposing_direction_rejected_in_ignore_new_mode() {
        let gate = gate();
        assert!(gate.direction_on(Direction::North).await.unwrap());
        assert!(!gate.direction_on(Direction::South).await.unwrap());
    }

    #[tokio::test]
    async fn opposing_direction_replaces_in_replace_mode() {
        let gate = MockGate::new(
            ConflictMode::Replace,
            Duration::from_secs(30),
            Duration::from_millis(500),
            Duration::from_millis(150),
            Duration::from_millis(200),
        );
        assert!(gate.direction_on(Direction::North).await.unwrap());
        assert!(gate.direction_on(Direction::South).await.unwrap());
    }

    #[tokio::test]
    async fn pulse_respects_cooldown() {
        let gate = gate();
        assert!(gate.pulse(PulseOutput::Coin).await.unwrap());
        assert!(!gate.pulse(PulseOutput::Coin).await.unwrap());
    }

    #[tokio::test]
    async fn emergency_stop_locks_and_rejects_further_calls() {
        let gate = gate();
        gate.direction_on(Direction::North).await.unwrap();
        gate.emergency_stop().await.unwrap();
        assert!(gate.is_locked());
        assert!(!gate.direction_on(Direction::East).await.unwrap());
        gate.unlock().await;
        assert!(!gate.is_locked());
    }

    #[tokio::test]
    async fn win_event_delivered_to_subscriber() {
        let gate = gate();
        let mut rx = gate.win_events();
        gate.trigger_win();
        assert!(rx.recv().await.is_some());
    }
}
