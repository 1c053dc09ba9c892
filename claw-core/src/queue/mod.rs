//! Queue Manager: CRUD over `queue_entries`, atomic position assignment,
//! duplicate-email prevention, and stale-entry cleanup on restart.

use std::sync::Arc;

use rand::RngCore;
use rusqlite::{OptionalExtension, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::store::{hash_token, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Waiting,
    Ready,
    Active,
    Done,
    Cancelled,
}

impl EntryState {
    fn as_str(self) -> &'static str {
        match self {
            EntryState::Waiting => "waiting",
            EntryState::Ready => "ready",
            EntryState::Active => "active",
            EntryState::Done => "done",
            EntryState::Cancelled => "cancelled",
        }
    }

    fn parse(raw: &str) -> CoreResult<EntryState> {
        Ok(match raw {
            "waiting" => EntryState::Waiting,
            "ready" => EntryState::Ready,
            "active" => EntryState::Active,
            "done" => EntryState::Done,
            "cancelled" => EntryState::Cancelled,
            other => return Err(CoreError::Invariant(format!("unknown entry state {other:?}"))),
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: String,
    pub token_hash: String,
    pub name: String,
    pub email: String,
    pub ip_address: Option<String>,
    pub state: EntryState,
    pub result: Option<String>,
    pub position: Option<i64>,
    pub tries_used: u32,
    pub created_at: String,
    pub activated_at: Option<String>,
    pub completed_at: Option<String>,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<QueueEntry> {
    let state_raw: String = row.get("state")?;
    Ok(QueueEntry {
        id: row.get("id")?,
        token_hash: row.get("token_hash")?,
        name: row.get("name")?,
        email: row.get("email")?,
        ip_address: row.get("ip_address")?,
        state: EntryState::parse(&state_raw).unwrap_or(EntryState::Done),
        result: row.get("result")?,
        position: row.get("position")?,
        tries_used: row.get::<_, i64>("tries_used")? as u32,
        created_at: row.get("created_at")?,
        activated_at: row.get("activated_at")?,
        completed_at: row.get("completed_at")?,
    })
}

pub struct JoinResult {
    pub id: String,
    pub token: String,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_length: i64,
    pub current_player: Option<String>,
    pub current_player_state: Option<String>,
}

/// Admin-facing queue view, identical to [`QueueEntry`] but explicit about
/// carrying `email`/`ip_address` — the public queue listing never exposes
/// those.
#[derive(Debug, Clone, Serialize)]
pub struct AdminQueueEntry {
    pub id: String,
    pub name: String,
    pub email: String,
    pub ip_address: Option<String>,
    pub state: EntryState,
    pub position: Option<i64>,
    pub tries_used: u32,
    pub created_at: String,
}

impl From<QueueEntry> for AdminQueueEntry {
    fn from(e: QueueEntry) -> Self {
        AdminQueueEntry {
            id: e.id,
            name: e.name,
            email: e.email,
            ip_address: e.ip_address,
            state: e.state,
            position: e.position,
            tries_used: e.tries_used,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub active: i64,
    pub total_completed: i64,
    pub total_wins: i64,
    pub total_entries: i64,
}

pub struct QueueManager {
    store: Arc<Store>,
}

impl QueueManager {
    pub fn new(store: Arc<Store>) -> QueueManager {
        QueueManager { store }
    }

    /// Add a player to the queue. Fails with [`CoreError::DuplicateEntry`]
    /// if the email already has a non-terminal entry.
    pub async fn join(&self, name: String, email: String, ip: String) -> CoreResult<JoinResult> {
        let entry_id = Uuid::new_v4().to_string();
        let raw_token = generate_token();
        let token_hash = hash_token(&raw_token);

        let entry_id_for_write = entry_id.clone();
        let email_for_write = email.clone();
        let name_for_write = name.clone();
        let position: i64 = self
            .store
            .write(move |conn| {
                let dup: Option<String> = conn
                    .query_row(
                        "SELECT id FROM queue_entries WHERE email = ?1 AND state IN ('waiting','ready','active')",
                        [&email_for_write],
                        |r| r.get(0),
                    )
                    .optional()?;
                if dup.is_some() {
                    return Err(rusqlite::Error::ModuleError("duplicate".to_string()));
                }

                conn.execute(
                    "INSERT INTO queue_entries (id, token_hash, name, email, ip_address, state, position) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 'waiting', \
                       COALESCE((SELECT MAX(position) FROM queue_entries \
                                 WHERE state IN ('waiting','ready','active')), 0) + 1)",
                    rusqlite::params![entry_id_for_write, token_hash, name_for_write, email_for_write, ip],
                )?;

                conn.query_row(
                    "SELECT position FROM queue_entries WHERE id = ?1",
                    [&entry_id_for_write],
                    |r| r.get(0),
                )
            })
            .await
            .map_err(|e| match e {
                CoreError::Store(rusqlite::Error::ModuleError(m)) if m == "duplicate" => {
                    CoreError::DuplicateEntry
                }
                other => other,
            })?;

        self.store
            .log_event(
                Some(entry_id.clone()),
                "join",
                Some(serde_json::json!({ "name": name, "position": position }).to_string()),
            )
            .await?;

        Ok(JoinResult { id: entry_id, token: raw_token, position })
    }

    /// Cancel a waiting/ready entry by its token hash. Returns `false` if
    /// no such entry exists (already active, already gone, or never existed).
    pub async fn leave(&self, token_hash: String) -> CoreResult<bool> {
        let token_hash_for_read = token_hash.clone();
        let entry_id: Option<String> = self
            .store
            .read(move |conn| {
                conn.query_row(
                    "SELECT id FROM queue_entries WHERE token_hash = ?1 AND state IN ('waiting','ready')",
                    [&token_hash_for_read],
                    |r| r.get(0),
                )
                .optional()
            })
            .await?;

        let Some(entry_id) = entry_id else { return Ok(false) };

        self.store
            .write(move |conn| {
                conn.execute(
                    "UPDATE queue_entries SET state = 'cancelled', completed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
                     WHERE token_hash = ?1 AND state IN ('waiting','ready')",
                    [&token_hash],
                )
            })
            .await?;

        self.store.log_event(Some(entry_id), "leave", None).await?;
        Ok(true)
    }

    /// Cancel a waiting/ready entry by its id, for admin kick. Unlike
    /// [`leave`](Self::leave) this looks up by entry id rather than token
    /// hash, since an admin never has the player's token. Returns `false`
    /// if the entry is active, already terminal, or doesn't exist — admin
    /// kick of an active player goes through `force_end_turn` instead.
    pub async fn cancel_entry(&self, entry_id: String) -> CoreResult<bool> {
        let entry_id_for_write = entry_id.clone();
        let updated = self
            .store
            .write(move |conn| {
                conn.execute(
                    "UPDATE queue_entries SET state = 'cancelled', completed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
                     WHERE id = ?1 AND state IN ('waiting','ready')",
                    [&entry_id_for_write],
                )
            })
            .await?;
        if updated == 0 {
            return Ok(false);
        }
        self.store.log_event(Some(entry_id), "admin_kick", None).await?;
        Ok(true)
    }

    pub async fn peek_next_waiting(&self) -> CoreResult<Option<QueueEntry>> {
        self.store
            .read(|conn| {
                conn.query_row(
                    "SELECT * FROM queue_entries WHERE state = 'waiting' ORDER BY position ASC LIMIT 1",
                    [],
                    row_to_entry,
                )
                .optional()
            })
            .await
    }

    pub async fn set_state(&self, entry_id: String, state: EntryState) -> CoreResult<()> {
        let state_str = state.as_str();
        let entry_id_for_write = entry_id.clone();
        self.store
            .write(move |conn| {
                let activated_at = if matches!(state_str, "active") {
                    Some(chrono::Utc::now().to_rfc3339())
                } else {
                    None
                };
                conn.execute(
                    "UPDATE queue_entries SET state = ?1, activated_at = COALESCE(?2, activated_at) WHERE id = ?3",
                    rusqlite::params![state_str, activated_at, entry_id_for_write],
                )
            })
            .await?;
        self.store.log_event(Some(entry_id), "state_change", Some(state_str.to_string())).await?;
        Ok(())
    }

    pub async fn complete_entry(&self, entry_id: String, result: &'static str, tries_used: u32) -> CoreResult<()> {
        let entry_id_for_write = entry_id.clone();
        self.store
            .write(move |conn| {
                conn.execute(
                    "UPDATE queue_entries SET state = 'done', result = ?1, tries_used = ?2, \
                     completed_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?3",
                    rusqlite::params![result, tries_used, entry_id_for_write],
                )
            })
            .await?;
        self.store
            .log_event(
                Some(entry_id),
                "turn_end",
                Some(serde_json::json!({ "result": result, "tries": tries_used }).to_string()),
            )
            .await?;
        Ok(())
    }

    /// Persist the absolute wall-clock deadlines for the active entry so a
    /// restart can recover roughly-correct remaining time. Live timing
    /// never reads these back — they exist purely for recovery bookkeeping.
    pub async fn write_deadlines(
        &self,
        entry_id: String,
        try_move_end_at: Option<chrono::DateTime<chrono::Utc>>,
        turn_end_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> CoreResult<()> {
        self.store
            .write(move |conn| {
                conn.execute(
                    "UPDATE queue_entries SET try_move_end_at = ?1, turn_end_at = ?2 WHERE id = ?3",
                    rusqlite::params![
                        try_move_end_at.map(|t| t.to_rfc3339()),
                        turn_end_at.map(|t| t.to_rfc3339()),
                        entry_id
                    ],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn get_by_token(&self, token_hash: String) -> CoreResult<Option<QueueEntry>> {
        self.store
            .read(move |conn| {
                conn.query_row(
                    "SELECT * FROM queue_entries WHERE token_hash = ?1",
                    [&token_hash],
                    row_to_entry,
                )
                .optional()
            })
            .await
    }

    pub async fn get_by_id(&self, entry_id: String) -> CoreResult<Option<QueueEntry>> {
        self.store
            .read(move |conn| {
                conn.query_row("SELECT * FROM queue_entries WHERE id = ?1", [&entry_id], row_to_entry).optional()
            })
            .await
    }

    pub async fn get_queue_status(&self) -> CoreResult<QueueStatus> {
        self.store
            .read(|conn| {
                let waiting: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE state = 'waiting'",
                    [],
                    |r| r.get(0),
                )?;
                let active: Option<(String, String)> = conn
                    .query_row(
                        "SELECT name, state FROM queue_entries WHERE state IN ('active','ready') LIMIT 1",
                        [],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                Ok(QueueStatus {
                    queue_length: waiting,
                    current_player: active.as_ref().map(|(n, _)| n.clone()),
                    current_player_state: active.map(|(_, s)| s),
                })
            })
            .await
    }

    /// Entries in `waiting`, `ready`, or `active`, ordered active-first.
    pub async fn list_queue(&self) -> CoreResult<Vec<QueueEntry>> {
        self.store
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM queue_entries WHERE state IN ('waiting','ready','active') \
                     ORDER BY CASE state WHEN 'active' THEN 0 WHEN 'ready' THEN 1 WHEN 'waiting' THEN 2 END, \
                     position ASC",
                )?;
                let rows = stmt.query_map([], row_to_entry)?;
                rows.collect()
            })
            .await
    }

    pub async fn get_recent_results(&self, limit: i64) -> CoreResult<Vec<QueueEntry>> {
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM queue_entries WHERE state = 'done' AND result IS NOT NULL \
                     ORDER BY completed_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map([limit], row_to_entry)?;
                rows.collect()
            })
            .await
    }

    pub async fn get_waiting_count(&self) -> CoreResult<i64> {
        self.store
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM queue_entries WHERE state = 'waiting'", [], |r| r.get(0)))
            .await
    }

    /// Same as [`list_queue`](Self::list_queue) but includes `email`/
    /// `ip_address` for admin dashboards.
    pub async fn list_queue_admin(&self) -> CoreResult<Vec<AdminQueueEntry>> {
        let entries = self
            .store
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM queue_entries WHERE state IN ('waiting','ready','active') \
                     ORDER BY CASE state WHEN 'active' THEN 0 WHEN 'ready' THEN 1 WHEN 'waiting' THEN 2 END, \
                     position ASC",
                )?;
                let rows = stmt.query_map([], row_to_entry)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(entries.into_iter().map(AdminQueueEntry::from).collect())
    }

    /// 1-based rank of `entry_id` among active-state (waiting/ready/active)
    /// entries, used for an "X people ahead of you" estimate. `None` if the
    /// entry isn't in one of those states.
    pub async fn get_waiting_rank(&self, entry_id: String) -> CoreResult<Option<i64>> {
        self.store
            .read(move |conn| {
                let position: Option<i64> = conn
                    .query_row(
                        "SELECT position FROM queue_entries WHERE id = ?1 AND state IN ('waiting','ready','active')",
                        [&entry_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(position) = position else { return Ok(None) };
                let rank: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE state IN ('waiting','ready','active') AND position <= ?1",
                    [position],
                    |r| r.get(0),
                )?;
                Ok(Some(rank))
            })
            .await
    }

    /// Aggregate counters for the admin dashboard.
    pub async fn get_stats(&self) -> CoreResult<QueueStats> {
        self.store
            .read(|conn| {
                let waiting: i64 =
                    conn.query_row("SELECT COUNT(*) FROM queue_entries WHERE state = 'waiting'", [], |r| r.get(0))?;
                let active: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE state IN ('active','ready')",
                    [],
                    |r| r.get(0),
                )?;
                let total_completed: i64 =
                    conn.query_row("SELECT COUNT(*) FROM queue_entries WHERE state = 'done'", [], |r| r.get(0))?;
                let total_wins: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM queue_entries WHERE result = 'win'",
                    [],
                    |r| r.get(0),
                )?;
                let total_entries: i64 =
                    conn.query_row("SELECT COUNT(*) FROM queue_entries", [], |r| r.get(0))?;
                Ok(QueueStats { waiting, active, total_completed, total_wins, total_entries })
            })
            .await
    }

    /// Called once at startup. `active` entries left over from a crash and
    /// any `ready` entry (whose WebSocket is necessarily gone) are expired.
    pub async fn cleanup_stale(&self, grace_seconds: u64) -> CoreResult<()> {
        self.store
            .write(move |conn| {
                conn.execute(
                    "UPDATE queue_entries SET state = 'done', result = 'expired', \
                     completed_at = COALESCE(completed_at, strftime('%Y-%m-%dT%H:%M:%fZ','now')) \
                     WHERE state = 'active' AND activated_at IS NOT NULL \
                     AND (julianday('now') - julianday(activated_at)) * 86400 > ?1",
                    [grace_seconds as i64],
                )?;
                conn.execute(
                    "UPDATE queue_entries SET state = 'done', result = 'expired', \
                     completed_at = COALESCE(completed_at, strftime('%Y-%m-%dT%H:%M:%fZ','now')) \
                     WHERE state = 'ready'",
                    [],
                )?;
                Ok(())
            })
            .await
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64_urlsafe(&bytes)
}

/// Minimal unpadded base64url encoder — avoids pulling in the `base64`
/// crate for a single call site.
fn base64_urlsafe(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut out = String::with_capacity((bytes.len() * 4).div_ceil(3));
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[(triple >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(triple >> 12 & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[(triple >> 6 & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(triple & 0x3f) as usize] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> (QueueManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("claw.db")).unwrap());
        (QueueManager::new(store), dir)
    }

    #[tokio::test]
    async fn join_assigns_sequential_positions() {
        let (qm, _dir) = manager().await;
        let a = qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let b = qm.join("Bob".into(), "bob@example.com".into(), "1.2.3.5".into()).await.unwrap();
        assert_eq!(a.position, 1);
        assert_eq!(b.position, 2);
    }

    #[tokio::test]
    async fn duplicate_email_rejected_while_active() {
        let (qm, _dir) = manager().await;
        qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let err = qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateEntry));
    }

    #[tokio::test]
    async fn leave_then_rejoin_succeeds() {
        let (qm, _dir) = manager().await;
        let a = qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let hash = hash_token(&a.token);
        assert!(qm.leave(hash).await.unwrap());
        // Same email can join again now that the prior entry is cancelled.
        qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_stale_expires_ready_and_old_active() {
        let (qm, _dir) = manager().await;
        let a = qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        qm.set_state(a.id.clone(), EntryState::Ready).await.unwrap();
        qm.cleanup_stale(0).await.unwrap();
        let entry = qm.get_by_id(a.id).await.unwrap().unwrap();
        assert_eq!(entry.result.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn waiting_rank_reflects_position_among_active_states() {
        let (qm, _dir) = manager().await;
        let a = qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let b = qm.join("Bob".into(), "bob@example.com".into(), "1.2.3.5".into()).await.unwrap();
        assert_eq!(qm.get_waiting_rank(a.id.clone()).await.unwrap(), Some(1));
        assert_eq!(qm.get_waiting_rank(b.id.clone()).await.unwrap(), Some(2));

        qm.leave(hash_token(&a.token)).await.unwrap();
        assert_eq!(qm.get_waiting_rank(a.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_entry_rejects_already_active() {
        let (qm, _dir) = manager().await;
        let a = qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        qm.set_state(a.id.clone(), EntryState::Active).await.unwrap();
        assert!(!qm.cancel_entry(a.id.clone()).await.unwrap());

        let b = qm.join("Bob".into(), "bob@example.com".into(), "1.2.3.5".into()).await.unwrap();
        assert!(qm.cancel_entry(b.id).await.unwrap());
    }

    #[tokio::test]
    async fn stats_count_entries_across_states() {
        let (qm, _dir) = manager().await;
        let a = qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        qm.join("Bob".into(), "bob@example.com".into(), "1.2.3.5".into()).await.unwrap();
        qm.set_state(a.id.clone(), EntryState::Active).await.unwrap();
        qm.complete_entry(a.id.clone(), "win", 1).await.unwrap();

        let stats = qm.get_stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.total_wins, 1);
        assert_eq!(stats.total_entries, 2);
    }

    #[tokio::test]
    async fn admin_listing_includes_contact_fields() {
        let (qm, _dir) = manager().await;
        qm.join("Alice".into(), "alice@example.com".into(), "1.2.3.4".into()).await.unwrap();
        let admin_rows = qm.list_queue_admin().await.unwrap();
        assert_eq!(admin_rows.len(), 1);
        assert_eq!(admin_rows[0].email, "alice@example.com");
        assert_eq!(admin_rows[0].ip_address.as_deref(), Some("1.2.3.4"));
    }
}
