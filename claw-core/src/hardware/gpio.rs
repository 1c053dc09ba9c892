//! Real Raspberry Pi GPIO backend, built on `rppal`. Only compiled with
//! the `gpio` feature — everywhere else (dev machines, CI) the mock gate
//! is used instead.
//!
//! Every blocking pin operation is dispatched through a
//! [`HardwareExecutor`] so a wedged call can never block the async
//! runtime, and a stuck worker is replaced rather than left to rot.

#![cfg(feature = "gpio")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::mock::ConflictMode;
use super::{reject_if_locked, Direction, HardwareGate, LockFlag, PulseOutput};
use crate::error::{CoreError, CoreResult};
use crate::hardware::executor::HardwareExecutor;

struct PinSet {
    coin: OutputPin,
    north: OutputPin,
    south: OutputPin,
    east: OutputPin,
    west: OutputPin,
    drop: OutputPin,
}

pub struct GpioPins {
    pub coin: u8,
    pub north: u8,
    pub south: u8,
    pub east: u8,
    pub west: u8,
    pub drop: u8,
    pub win: u8,
}

pub struct GpioGate {
    self_ref: std::sync::Weak<GpioGate>,
    executor: HardwareExecutor,
    pins: Arc<StdMutex<PinSet>>,
    lock: LockFlag,
    active_low: bool,
    conflict_mode: ConflictMode,
    holds: Mutex<HashMap<Direction, JoinHandle<()>>>,
    last_pulse: Mutex<HashMap<PulseOutput, Instant>>,
    direction_hold_max: Duration,
    min_inter_pulse: Duration,
    coin_pulse: Duration,
    drop_pulse: Duration,
    win_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    // Keeps the win input pin (and its async interrupt registration) alive
    // for the lifetime of the gate.
    _win_input: StdMutex<InputPin>,
}

impl GpioGate {
    pub fn new(
        pins: GpioPins,
        active_low: bool,
        conflict_mode: ConflictMode,
        call_timeout: Duration,
        direction_hold_max: Duration,
        min_inter_pulse: Duration,
        coin_pulse: Duration,
        drop_pulse: Duration,
    ) -> CoreResult<Arc<GpioGate>> {
        let gpio = Gpio::new().map_err(|e| CoreError::Config(format!("gpio init failed: {e}")))?;
        let off_level = if active_low { Level::High } else { Level::Low };

        let mut make_output = |pin: u8| -> CoreResult<OutputPin> {
            let mut out = gpio
                .get(pin)
                .map_err(|e| CoreError::Config(format!("pin {pin}: {e}")))?
                .into_output();
            out.write(off_level);
            Ok(out)
        };

        let pin_set = PinSet {
            coin: make_output(pins.coin)?,
            north: make_output(pins.north)?,
            south: make_output(pins.south)?,
            east: make_output(pins.east)?,
            west: make_output(pins.west)?,
            drop: make_output(pins.drop)?,
        };

        let mut win_input = gpio
            .get(pins.win)
            .map_err(|e| CoreError::Config(format!("win pin {pins.win}: {e}")))?
            .into_input_pullup();

        let (win_tx, win_rx) = mpsc::unbounded_channel();
        let win_tx_for_interrupt = win_tx.clone();
        win_input
            .set_async_interrupt(Trigger::RisingEdge, move |_level| {
                let _ = win_tx_for_interrupt.send(());
            })
            .map_err(|e| CoreError::Config(format!("win interrupt registration failed: {e}")))?;

        Ok(Arc::new_cyclic(|self_ref| GpioGate {
            self_ref: self_ref.clone(),
            executor: HardwareExecutor::new(call_timeout),
            pins: Arc::new(StdMutex::new(pin_set)),
            lock: LockFlag::new(),
            active_low,
            conflict_mode,
            holds: Mutex::new(HashMap::new()),
            last_pulse: Mutex::new(HashMap::new()),
            direction_hold_max,
            min_inter_pulse,
            coin_pulse,
            drop_pulse,
            win_rx: Mutex::new(Some(win_rx)),
            _win_input: StdMutex::new(win_input),
        }))
    }

    fn on_level(&self) -> Level {
        if self.active_low { Level::Low } else { Level::High }
    }

    fn off_level(&self) -> Level {
        if self.active_low { Level::High } else { Level::Low }
    }

    async fn set_direction_pin(&self, direction: Direction, on: bool) -> CoreResult<()> {
        let pins = Arc::clone(&self.pins);
        let level = if on { self.on_level() } else { self.off_level() };
        self.executor
            .dispatch(move || {
                let mut pins = pins.lock().expect("gpio pin set mutex poisoned");
                let pin = match direction {
                    Direction::North => &mut pins.north,
                    Direction::South => &mut pins.south,
                    Direction::East => &mut pins.east,
                    Direction::West => &mut pins.west,
                };
                pin.write(level);
            })
            .await
    }

    async fn cancel_hold(&self, direction: Direction) {
        let mut holds = self.holds.lock().await;
        if let Some(handle) = holds.remove(&direction) {
            handle.abort();
        }
    }
}

#[async_trait::async_trait]
impl HardwareGate for GpioGate {
    async fn direction_on(&self, direction: Direction) -> CoreResult<bool> {
        reject_if_locked(self.lock.get())?;
        let opposite = direction.opposite();
        {
            let holds = self.holds.lock().await;
            if holds.contains_key(&opposite) && self.conflict_mode == ConflictMode::IgnoreNew {
                return Ok(false);
            }
            if holds.contains_key(&direction) {
                return Ok(true);
            }
        }
        if self.conflict_mode == ConflictMode::Replace {
            self.direction_off(opposite).await?;
        }

        self.set_direction_pin(direction, true).await?;

        let hold_max = self.direction_hold_max;
        let weak = self.self_ref.clone();
        let mut holds = self.holds.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(hold_max).await;
            tracing::warn!(?direction, "direction hold timeout reached, auto-releasing");
            if let Some(gate) = weak.upgrade() {
                let _ = gate.direction_off(direction).await;
            }
        });
        holds.insert(direction, handle);
        Ok(true)
    }

    async fn direction_off(&self, direction: Direction) -> CoreResult<bool> {
        self.cancel_hold(direction).await;
        self.set_direction_pin(direction, false).await?;
        Ok(true)
    }

    async fn all_directions_off(&self) -> CoreResult<()> {
        let directions: Vec<Direction> = {
            let holds = self.holds.lock().await;
            holds.keys().copied().collect()
        };
        for d in directions {
            self.direction_off(d).await?;
        }
        Ok(())
    }

    async fn drop_on(&self) -> CoreResult<()> {
        reject_if_locked(self.lock.get())?;
        let pins = Arc::clone(&self.pins);
        let level = self.on_level();
        self.executor
            .dispatch(move || {
                pins.lock().expect("gpio pin set mutex poisoned").drop.write(level);
            })
            .await
    }

    async fn drop_off(&self) -> CoreResult<()> {
        let pins = Arc::clone(&self.pins);
        let level = self.off_level();
        self.executor
            .dispatch(move || {
                pins.lock().expect("gpio pin set mutex poisoned").drop.write(level);
            })
            .await
    }

    async fn pulse(&self, output: PulseOutput) -> CoreResult<bool> {
        if self.lock.get() {
            return Ok(false);
        }
        let now = Instant::now();
        {
            let mut last_pulse = self.last_pulse.lock().await;
            let ok = match last_pulse.get(&output) {
                Some(last) => now.duration_since(*last) >= self.min_inter_pulse,
                None => true,
            };
            if !ok {
                return Ok(false);
            }
            last_pulse.insert(output, now);
        }

        let pins = Arc::clone(&self.pins);
        let on_level = self.on_level();
        let off_level = self.off_level();
        let duration = match output {
            PulseOutput::Coin => self.coin_pulse,
            PulseOutput::Drop => self.drop_pulse,
        };
        self.executor
            .dispatch(move || {
                let mut pins = pins.lock().expect("gpio pin set mutex poisoned");
                let pin = match output {
                    PulseOutput::Coin => &mut pins.coin,
                    PulseOutput::Drop => &mut pins.drop,
                };
                pin.write(on_level);
                std::thread::sleep(duration);
                pin.write(off_level);
            })
            .await?;
        Ok(true)
    }

    async fn emergency_stop(&self) -> CoreResult<()> {
        self.lock.set(true);
        {
            let mut holds = self.holds.lock().await;
            for handle in holds.values() {
                handle.abort();
            }
            holds.clear();
        }
        let pins = Arc::clone(&self.pins);
        let off_level = self.off_level();
        self.executor
            .dispatch(move || {
                let mut pins = pins.lock().expect("gpio pin set mutex poisoned");
                pins.coin.write(off_level);
                pins.north.write(off_level);
                pins.south.write(off_level);
                pins.east.write(off_level);
                pins.west.write(off_level);
                pins.drop.write(off_level);
            })
            .await?;
        tracing::warn!("EMERGENCY STOP: all outputs off");
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
