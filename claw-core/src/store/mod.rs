//! Embedded relational store: a single writer connection guarded by a
//! mutex (SQLite only ever allows one writer regardless) plus a small pool
//! of reader connections for concurrent reads, all against one WAL-mode
//! database file.

mod migrations;

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

pub struct Store {
    writer: Arc<StdMutex<Connection>>,
    readers: r2d2::Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (creating if necessary) the database at `path`, apply pragmas,
    /// and run any pending migrations. Safe to call with `path` set to
    /// `:memory:` for tests, though `:memory:` readers then see an empty
    /// database — tests should use a tempfile instead.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Store> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open(path)?;
        configure(&writer)?;
        migrations::apply_pending(&writer)?;

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            configure(conn).map_err(|e| rusqlite::Error::ModuleError(e.to_string()))?;
            Ok(())
        });
        let readers = r2d2::Pool::builder().max_size(4).build(manager).map_err(|e| {
            CoreError::Config(format!("failed to build reader pool: {e}"))
        })?;

        Ok(Store { writer: Arc::new(StdMutex::new(writer)), readers })
    }

    /// Run `f` against the single writer connection on a blocking thread.
    pub async fn write<F, R>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let conn = writer.lock().expect("writer mutex poisoned");
            f(&conn).map_err(CoreError::from)
        })
        .await
        .map_err(|e| CoreError::Invariant(format!("blocking write task panicked: {e}")))?
    }

    /// Run `f` against a pooled reader connection on a blocking thread.
    pub async fn read<F, R>(&self, f: F) -> CoreResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.readers.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn).map_err(CoreError::from)
        })
        .await
        .map_err(|e| CoreError::Invariant(format!("blocking read task panicked: {e}")))?
    }

    /// Append an event row. Never fails loudly to the caller's business
    /// logic — callers that treat logging as best-effort should `let _ =`
    /// or log-and-ignore the returned error themselves.
    pub async fn log_event(
        &self,
        entry_id: Option<String>,
        event_type: &'static str,
        detail: Option<String>,
    ) -> CoreResult<()> {
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO game_events (queue_entry_id, event_type, detail) VALUES (?1, ?2, ?3)",
                rusqlite::params![entry_id, event_type, detail],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete terminal queue entries older than `retention_hours`, and
    /// their events first — `game_events` has no FK to cascade on, so
    /// the entry-then-event order would orphan rows forever. Called on a
    /// timer by the supervisor.
    pub async fn prune_old_entries(&self, retention_hours: u64) -> CoreResult<usize> {
        self.write(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM game_events WHERE queue_entry_id IN ( \
                     SELECT id FROM queue_entries WHERE state IN ('done','cancelled') \
                     AND completed_at IS NOT NULL \
                     AND (julianday('now') - julianday(completed_at)) * 24 > ?1 \
                 )",
                [retention_hours as i64],
            )?;
            let deleted = tx.execute(
                "DELETE FROM queue_entries WHERE state IN ('done','cancelled') \
                 AND completed_at IS NOT NULL \
                 AND (julianday('now') - julianday(completed_at)) * 24 > ?1",
                [retention_hours as i64],
            )?;
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Delete `rate_limit_hits` rows older than `window_hours`. The
    /// in-memory sliding window in `ratelimit::RateLimiter` only needs the
    /// last second of hits; this table otherwise grows without bound.
    pub async fn prune_old_rate_limit_hits(&self, window_hours: u64) -> CoreResult<usize> {
        self.write(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM rate_limit_hits WHERE (julianday('now') - julianday(created_at)) * 24 > ?1",
                [window_hours as i64],
            )?;
            Ok(deleted)
        })
        .await
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

/// SHA-256 hex digest of a bearer token, matching the hash stored alongside
/// each queue entry — tokens themselves are never persisted.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut s = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            write!(s, "{b:02x}").unwrap();
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("claw.db")).unwrap();
        let count: i64 = store
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn log_event_then_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("claw.db")).unwrap();
        store.log_event(None, "server_start", None).await.unwrap();
        let count: i64 = store
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM game_events", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn prune_old_entries_deletes_events_before_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("claw.db")).unwrap();
        store
            .write(|conn| {
                conn.execute(
                    "INSERT INTO queue_entries (id, token_hash, name, email, state, completed_at) \
                     VALUES ('old', 'hash-old', 'Old', 'old@example.com', 'done', \
                     strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '-100 hours'))",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO queue_entries (id, token_hash, name, email, state, completed_at) \
                     VALUES ('recent', 'hash-recent', 'Recent', 'recent@example.com', 'done', \
                     strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))",
                    [],
                )?;
                conn.execute("INSERT INTO game_events (queue_entry_id, event_type) VALUES ('old', 'turn_end')", [])?;
                conn.execute("INSERT INTO game_events (queue_entry_id, event_type) VALUES ('recent', 'turn_end')", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let deleted = store.prune_old_entries(24).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining_entries: i64 =
            store.read(|conn| conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |r| r.get(0))).await.unwrap();
        assert_eq!(remaining_entries, 1);

        let orphaned_events: i64 = store
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM game_events WHERE queue_entry_id = 'old'", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(orphaned_events, 0);

        let remaining_events: i64 =
            store.read(|conn| conn.query_row("SELECT COUNT(*) FROM game_events", [], |r| r.get(0))).await.unwrap();
        assert_eq!(remaining_events, 1);
    }

    #[tokio::test]
    async fn prune_old_rate_limit_hits_deletes_past_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("claw.db")).unwrap();
        store
            .write(|conn| {
                conn.execute(
                    "INSERT INTO rate_limit_hits (bucket_key, created_at) \
                     VALUES ('ip:1.2.3.4', strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '-100 hours'))",
                    [],
                )?;
                conn.execute("INSERT INTO rate_limit_hits (bucket_key) VALUES ('ip:1.2.3.4')", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let deleted = store.prune_old_rate_limit_hits(24).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining: i64 =
            store.read(|conn| conn.query_row("SELECT COUNT(*) FROM rate_limit_hits", [], |r| r.get(0))).await.unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn hash_token_is_stable_sha256() {
        let a = hash_token("abc");
        let b = hash_token("abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_token("abcd"));
    }
}
