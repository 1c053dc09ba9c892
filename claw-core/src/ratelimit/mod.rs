//! Rate Limiter: sliding-window request throttling for queue joins.
//!
//! Two layers are consulted for every check, and either rejecting aborts
//! the request:
//!
//! - an in-memory sliding window (fast, avoids a database round trip for
//!   the common case, but resets on restart)
//! - a durable count against `rate_limit_hits` (source of truth, survives
//!   restarts and is shared across however many server processes point at
//!   the same database file)
//!
//! A hit is only recorded in either layer once both have allowed the
//! request — a request rejected by the durable check never pollutes the
//! in-memory window either.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::CoreResult;
use crate::store::Store;

pub struct RateLimiter {
    store: Arc<Store>,
    memory: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<Store>) -> RateLimiter {
        RateLimiter { store, memory: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` if `key` is allowed one more hit within `window`,
    /// given a maximum of `max` hits — and records the hit if so. `key`
    /// should already be namespaced (e.g. `"ip:1.2.3.4"`, `"email:a@b.com"`)
    /// since the same bucket table backs every caller.
    pub async fn check(&self, key: &str, max: u32, window: Duration) -> CoreResult<bool> {
        if !self.memory_allows(key, max, window).await {
            return Ok(false);
        }
        if !self.durable_allows(key, max, window).await? {
            return Ok(false);
        }
        self.memory_record(key).await;
        self.durable_record(key).await?;
        Ok(true)
    }

    async fn memory_allows(&self, key: &str, max: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut memory = self.memory.lock().await;
        let hits = memory.entry(key.to_string()).or_default();
        hits.retain(|t| now.duration_since(*t) < window);
        (hits.len() as u32) < max
    }

    async fn memory_record(&self, key: &str) {
        let mut memory = self.memory.lock().await;
        memory.entry(key.to_string()).or_default().push(Instant::now());
    }

    async fn durable_allows(&self, key: &str, max: u32, window: Duration) -> CoreResult<bool> {
        let key = key.to_string();
        let window_secs = window.as_secs_f64();
        let count: i64 = self
            .store
            .read(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM rate_limit_hits \
                     WHERE bucket_key = ?1 AND (julianday('now') - julianday(created_at)) * 86400 <= ?2",
                    rusqlite::params![key, window_secs],
                    |r| r.get(0),
                )
            })
            .await?;
        Ok((count as u32) < max)
    }

    async fn durable_record(&self, key: &str) -> CoreResult<()> {
        let key = key.to_string();
        self.store
            .write(move |conn| {
                conn.execute("INSERT INTO rate_limit_hits (bucket_key) VALUES (?1)", [key])?;
                Ok(())
            })
            .await
    }

    /// Drop stale in-memory windows so long-lived buckets (e.g. an IP that
    /// hit the limit once a week ago) don't accumulate forever. Durable
    /// rows are swept separately by `Store::prune_old_rate_limit_hits`,
    /// called on the supervisor's retention-prune timer.
    pub async fn sweep_memory(&self, max_age: Duration) {
        let now = Instant::now();
        let mut memory = self.memory.lock().await;
        memory.retain(|_, hits| {
            hits.retain(|t| now.duration_since(*t) < max_age);
            !hits.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn limiter() -> (RateLimiter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("claw.db")).unwrap());
        (RateLimiter::new(store), dir)
    }

    #[tokio::test]
    async fn allows_up_to_max_then_rejects() {
        let (rl, _dir) = limiter().await;
        let window = Duration::from_secs(3600);
        assert!(rl.check("ip:1.2.3.4", 2, window).await.unwrap());
        assert!(rl.check("ip:1.2.3.4", 2, window).await.unwrap());
        assert!(!rl.check("ip:1.2.3.4", 2, window).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_tracked_independently() {
        let (rl, _dir) = limiter().await;
        let window = Duration::from_secs(3600);
        assert!(rl.check("ip:1.2.3.4", 1, window).await.unwrap());
        assert!(rl.check("email:a@b.com", 1, window).await.unwrap());
    }

    #[tokio::test]
    async fn durable_layer_rejects_even_after_memory_window_is_cleared() {
        let (rl, _dir) = limiter().await;
        let window = Duration::from_secs(3600);
        assert!(rl.check("ip:1.2.3.4", 1, window).await.unwrap());
        // Simulate a restart by wiping the in-memory half only.
        rl.memory.lock().await.clear();
        assert!(!rl.check("ip:1.2.3.4", 1, window).await.unwrap());
    }
}
