use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::{
    db::{
        helpers::{from_json, parse_datetime, to_json},
        Database,
    },
    reaction::TestSession,
};

/// A completed session that has not been committed yet.
#[derive(Debug, Clone)]
pub struct PendingSession {
    pub session: TestSession,
    pub saved_at: DateTime<Utc>,
}

pub struct PendingSessionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> PendingSessionRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn save(&self, session: &TestSession) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_sessions (started_at_ms, user_id, body, saved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(started_at_ms) DO UPDATE SET
                 user_id = excluded.user_id,
                 body = excluded.body,
                 saved_at = excluded.saved_at",
            params![
                session.timestamp_ms(),
                session.user_id,
                to_json(session, "pending session")?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, started_at_ms: i64) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM pending_sessions WHERE started_at_ms = ?1",
            params![started_at_ms],
        )?;
        Ok(removed > 0)
    }

    /// Oldest first.
    pub fn list(&self) -> Result<Vec<PendingSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT body, saved_at FROM pending_sessions ORDER BY started_at_ms ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut pending = Vec::new();
        while let Some(row) = rows.next()? {
            let body: String = row.get(0)?;
            let saved_at: String = row.get(1)?;
            pending.push(PendingSession {
                session: from_json(&body, "pending session")?,
                saved_at: parse_datetime(&saved_at, "saved_at")?,
            });
        }
        Ok(pending)
    }
}

impl Database {
    pub async fn save_pending_session(&self, session: &TestSession) -> Result<()> {
        let session = session.clone();
        self.execute(move |conn| PendingSessionRepository::new(conn).save(&session))
            .await
    }

    /// Returns whether a journal entry existed.
    pub async fn remove_pending_session(&self, started_at_ms: i64) -> Result<bool> {
        self.execute(move |conn| PendingSessionRepository::new(conn).remove(started_at_ms))
            .await
    }

    pub async fn list_pending_sessions(&self) -> Result<Vec<PendingSession>> {
        self.execute(|conn| PendingSessionRepository::new(conn).list())
            .await
    }
}
