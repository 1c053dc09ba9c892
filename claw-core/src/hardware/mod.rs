//! Hardware Gate: serializes access to the physical relay/sensor pins and
//! recovers from a stuck call instead of wedging the whole process.
//!
//! All real pin I/O happens on a dedicated executor thread (see
//! [`executor`]); this module exposes the async-facing [`HardwareGate`]
//! trait plus the two backends ([`mock::MockGate`], [`gpio::GpioGate`]).

pub mod executor;
pub mod gpio;
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{CoreError, CoreResult};

/// Directions a player can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
        }
    }
}

/// A pulse-driven output (fire briefly, then off automatically).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseOutput {
    Coin,
    Drop,
}

/// The narrow interface the turn state machine drives. Implemented by a
/// software-only mock (default, safe everywhere) and a real `rppal`-backed
/// GPIO gate (feature `gpio`, Raspberry Pi only).
#[async_trait::async_trait]
pub trait HardwareGate: Send + Sync {
    async fn direction_on(&self, direction: Direction) -> CoreResult<bool>;
    async fn direction_off(&self, direction: Direction) -> CoreResult<bool>;
    async fn all_directions_off(&self) -> CoreResult<()>;
    async fn drop_on(&self) -> CoreResult<()>;
    async fn drop_off(&self) -> CoreResult<()>;
    async fn pulse(&self, output: PulseOutput) -> CoreResult<bool>;
    async fn emergency_stop(&self) -> CoreResult<()>;
    async fn unlock(&self);
    fn is_locked(&self) -> bool;

    /// Subscribe to win-sensor edge events. The receiver yields `()` once
    /// per detected win; it stays open for the lifetime of the gate.
    fn win_events(&self) -> mpsc::UnboundedReceiver<()>;
}

/// Shared locked-flag plumbing used by both backends so `emergency_stop`
/// and `unlock` behave identically regardless of what's behind them.
#[derive(Clone)]
pub struct LockFlag(Arc<AtomicBool>);

impl LockFlag {
    pub fn new() -> LockFlag {
        LockFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self, locked: bool) {
        self.0.store(locked, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for LockFlag {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn reject_if_locked(locked: bool) -> CoreResult<()> {
    if locked {
        Err(CoreError::HardwareLocked)
    } else {
        Ok(())
    }
}

impl From<protocol::Direction> for Direction {
    fn from(d: protocol::Direction) -> Direction {
        match d {
            protocol::Direction::North => Direction::North,
            protocol::Direction::South => Direction::South,
            protocol::Direction::East => Direction::East,
            protocol::Direction::West => Direction::West,
        }
    }
}
