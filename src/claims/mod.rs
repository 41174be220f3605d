//! C4: claim coordinator.
//!
//! Backed by `rusqlite` (bundled SQLite), the way `tandem-memory` and
//! `src-tauri` persist local relational state in the broader example pack.
//! `rusqlite::Connection` is `Send` but not `Sync`, so it is wrapped in
//! `Arc<Mutex<_>>` the way the teacher wraps its other stateful singletons
//! (`SystemMonitorInternal`, the orchestrator's atomic state).

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::constants::CLAIMS_DB_RELATIVE;
use crate::events::{ClaimEvent, Event, EventBus};
use crate::models::{Claim, ClaimMetadata};
use crate::{AppError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct ClaimStats {
    pub active_claims: u64,
    pub distinct_sessions: u64,
}

pub struct ClaimCoordinator {
    conn: Arc<Mutex<Connection>>,
    events: EventBus,
}

impl ClaimCoordinator {
    pub fn open(project_root: &Path, events: EventBus) -> Result<Self> {
        let path = project_root.join(CLAIMS_DB_RELATIVE);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id INTEGER PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS claims (
                task_id TEXT PRIMARY KEY,
                session_id INTEGER NOT NULL,
                claimed_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                pattern TEXT,
                subtask_count INTEGER,
                agent_type TEXT,
                FOREIGN KEY(session_id) REFERENCES sessions(session_id)
            );",
        )?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), events })
    }

    /// `claim(taskId, sessionId, {ttlMs, metadata, agentType}) -> {claimed, claim?}`.
    pub async fn claim(
        &self,
        task_id: &str,
        session_id: i64,
        ttl: chrono::Duration,
        metadata: ClaimMetadata,
    ) -> Result<Claim> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        let existing: Option<String> = conn
            .query_row(
                "SELECT expires_at FROM claims WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(expires_raw) = existing {
            let expires_at: DateTime<Utc> = expires_raw.parse().map_err(|_| {
                AppError::StoreCorrupted(format!("unparsable expires_at for claim {task_id}"))
            })?;
            if expires_at > now {
                return Err(AppError::TaskAlreadyClaimed { task_id: task_id.to_string() });
            }
        }

        conn.execute(
            "INSERT OR IGNORE INTO sessions(session_id) VALUES (?1)",
            params![session_id],
        )?;

        let expires_at = now + ttl;
        conn.execute(
            "INSERT INTO claims (task_id, session_id, claimed_at, expires_at, last_heartbeat, pattern, subtask_count, agent_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(task_id) DO UPDATE SET
                session_id = excluded.session_id,
                claimed_at = excluded.claimed_at,
                expires_at = excluded.expires_at,
                last_heartbeat = excluded.last_heartbeat,
                pattern = excluded.pattern,
                subtask_count = excluded.subtask_count,
                agent_type = excluded.agent_type",
            params![
                task_id,
                session_id,
                now.to_rfc3339(),
                expires_at.to_rfc3339(),
                now.to_rfc3339(),
                metadata.pattern,
                metadata.subtask_count,
                metadata.agent_type,
            ],
        )?;

        self.events
            .publish(Event::Claim(ClaimEvent::Claimed { task_id: task_id.to_string(), session_id }));

        Ok(Claim {
            task_id: task_id.to_string(),
            session_id,
            claimed_at: now,
            expires_at,
            last_heartbeat: now,
            pattern: metadata.pattern,
            subtask_count: metadata.subtask_count,
            agent_type: metadata.agent_type,
        })
    }

    /// `refresh(taskId, sessionId, ttlMs?) -> {success}`.
    pub async fn refresh(&self, task_id: &str, session_id: i64, ttl: chrono::Duration) -> Result<()> {
        let conn = self.conn.lock().await;
        self.assert_owner(&conn, task_id, session_id)?;

        let now = Utc::now();
        let expires_at = now + ttl;
        conn.execute(
            "UPDATE claims SET last_heartbeat = ?1, expires_at = ?2 WHERE task_id = ?3",
            params![now.to_rfc3339(), expires_at.to_rfc3339(), task_id],
        )?;
        Ok(())
    }

    /// `release(taskId, sessionId, reason) -> {success}`.
    pub async fn release(&self, task_id: &str, session_id: i64, _reason: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        self.assert_owner(&conn, task_id, session_id)?;
        conn.execute("DELETE FROM claims WHERE task_id = ?1", params![task_id])?;
        self.events
            .publish(Event::Claim(ClaimEvent::Released { task_id: task_id.to_string(), session_id }));
        Ok(())
    }

    fn assert_owner(&self, conn: &Connection, task_id: &str, session_id: i64) -> Result<()> {
        let owner: Option<i64> = conn
            .query_row("SELECT session_id FROM claims WHERE task_id = ?1", params![task_id], |row| row.get(0))
            .optional()?;
        match owner {
            None => Err(AppError::ClaimNotFound { task_id: task_id.to_string() }),
            Some(owner_id) if owner_id != session_id => {
                Err(AppError::NotClaimOwner { task_id: task_id.to_string(), session_id })
            }
            Some(_) => Ok(()),
        }
    }

    /// `cleanupExpired()` — deletes all rows with `expiresAt < now`.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let count = conn.execute("DELETE FROM claims WHERE expires_at < ?1", params![now])?;
        drop(conn);
        if count > 0 {
            self.events.publish(Event::Claim(ClaimEvent::CleanupExpired { count }));
        }
        Ok(count)
    }

    /// `cleanupOrphaned()` — deletes claims whose session no longer exists
    /// in the live registry and whose heartbeat is stale (twice the TTL).
    pub async fn cleanup_orphaned(&self, live_session_ids: &[i64], stale_after: chrono::Duration) -> Result<usize> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - stale_after).to_rfc3339();

        let mut stmt = conn.prepare("SELECT task_id, session_id, last_heartbeat FROM claims")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut deleted = 0;
        for (task_id, session_id, last_heartbeat) in rows {
            let orphaned = !live_session_ids.contains(&session_id) && last_heartbeat < cutoff;
            if orphaned {
                conn.execute("DELETE FROM claims WHERE task_id = ?1", params![task_id])?;
                deleted += 1;
            }
        }

        drop(conn);
        if deleted > 0 {
            self.events.publish(Event::Claim(ClaimEvent::CleanupOrphaned { count: deleted }));
        }
        Ok(deleted)
    }

    pub async fn get_active_claims(&self) -> Result<Vec<Claim>> {
        let conn = self.conn.lock().await;
        self.select_claims(&conn, "SELECT task_id, session_id, claimed_at, expires_at, last_heartbeat, pattern, subtask_count, agent_type FROM claims", params![])
    }

    pub async fn get_claims_by_session(&self, session_id: i64) -> Result<Vec<Claim>> {
        let conn = self.conn.lock().await;
        self.select_claims(
            &conn,
            "SELECT task_id, session_id, claimed_at, expires_at, last_heartbeat, pattern, subtask_count, agent_type FROM claims WHERE session_id = ?1",
            params![session_id],
        )
    }

    pub async fn get_claim_stats(&self) -> Result<ClaimStats> {
        let conn = self.conn.lock().await;
        let active_claims: u64 = conn.query_row("SELECT COUNT(*) FROM claims", [], |row| row.get(0))?;
        let distinct_sessions: u64 =
            conn.query_row("SELECT COUNT(DISTINCT session_id) FROM claims", [], |row| row.get(0))?;
        Ok(ClaimStats { active_claims, distinct_sessions })
    }

    fn select_claims(&self, conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Claim>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            let claimed_at: String = row.get(2)?;
            let expires_at: String = row.get(3)?;
            let last_heartbeat: String = row.get(4)?;
            Ok(Claim {
                task_id: row.get(0)?,
                session_id: row.get(1)?,
                claimed_at: claimed_at.parse().unwrap_or_else(|_| Utc::now()),
                expires_at: expires_at.parse().unwrap_or_else(|_| Utc::now()),
                last_heartbeat: last_heartbeat.parse().unwrap_or_else(|_| Utc::now()),
                pattern: row.get(5)?,
                subtask_count: row.get(6)?,
                agent_type: row.get(7)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(AppError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn p4_claim_is_exclusive_until_released() {
        let dir = tempdir().unwrap();
        let coord = ClaimCoordinator::open(dir.path(), EventBus::new()).unwrap();

        coord.claim("task-1", 1, chrono::Duration::minutes(30), ClaimMetadata::default()).await.unwrap();
        let err = coord
            .claim("task-1", 2, chrono::Duration::minutes(30), ClaimMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TaskAlreadyClaimed { .. }));

        coord.release("task-1", 1, "done").await.unwrap();
        coord.claim("task-1", 2, chrono::Duration::minutes(30), ClaimMetadata::default()).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_and_release_reject_non_owners() {
        let dir = tempdir().unwrap();
        let coord = ClaimCoordinator::open(dir.path(), EventBus::new()).unwrap();

        coord.claim("task-1", 1, chrono::Duration::minutes(30), ClaimMetadata::default()).await.unwrap();
        let err = coord.refresh("task-1", 2, chrono::Duration::minutes(30)).await.unwrap_err();
        assert!(matches!(err, AppError::NotClaimOwner { .. }));

        let err = coord.release("task-1", 2, "nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotClaimOwner { .. }));
    }

    #[tokio::test]
    async fn release_of_unknown_claim_fails() {
        let dir = tempdir().unwrap();
        let coord = ClaimCoordinator::open(dir.path(), EventBus::new()).unwrap();
        let err = coord.release("missing", 1, "noop").await.unwrap_err();
        assert!(matches!(err, AppError::ClaimNotFound { .. }));
    }

    #[tokio::test]
    async fn cleanup_expired_removes_past_claims() {
        let dir = tempdir().unwrap();
        let coord = ClaimCoordinator::open(dir.path(), EventBus::new()).unwrap();
        coord.claim("task-1", 1, chrono::Duration::milliseconds(-1), ClaimMetadata::default()).await.unwrap();
        let removed = coord.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn cleanup_orphaned_removes_claims_of_dead_sessions() {
        let dir = tempdir().unwrap();
        let coord = ClaimCoordinator::open(dir.path(), EventBus::new()).unwrap();
        coord.claim("task-1", 1, chrono::Duration::minutes(30), ClaimMetadata::default()).await.unwrap();
        let removed = coord.cleanup_orphaned(&[], chrono::Duration::milliseconds(-1)).await.unwrap();
        assert_eq!(removed, 1);
    }
}
