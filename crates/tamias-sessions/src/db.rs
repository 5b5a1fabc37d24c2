//! Auxiliary SQLite store — `data.sqlite`.
//!
//! Holds the `ai_logs` usage ledger plus mirror `sessions`/`messages`
//! tables for offline querying. Everything here is best-effort: the JSON
//! snapshots in `projects/` are the source of truth, and a failed write
//! must never fail a user-facing turn.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::warn;

use tamias_core::error::{Result, TamiasError};

use crate::types::Session;

/// Thread-safe wrapper around the auxiliary database connection.
pub struct AuxDb {
    conn: Mutex<Connection>,
}

/// Initialise the schema. Safe to call on every startup — uses
/// `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS ai_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL,
            model       TEXT NOT NULL,
            tokens_in   INTEGER NOT NULL DEFAULT 0,
            tokens_out  INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS sessions (
            id          TEXT PRIMARY KEY,
            model       TEXT NOT NULL,
            channel_id  TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id  TEXT NOT NULL,
            role        TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ai_logs_session ON ai_logs(session_id);
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);",
    )
}

impl AuxDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn =
            Connection::open(path).map_err(|e| TamiasError::Database(e.to_string()))?;
        init_db(&conn).map_err(|e| TamiasError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record one completed turn's usage. Numbers are best-effort and may
    /// be zeros when a provider omits them.
    pub fn log_turn(
        &self,
        session_id: &str,
        model: &str,
        tokens_in: u32,
        tokens_out: u32,
        duration_ms: u64,
    ) {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute(
            "INSERT INTO ai_logs (session_id, model, tokens_in, tokens_out, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![session_id, model, tokens_in, tokens_out, duration_ms as i64, now],
        ) {
            warn!(error = %e, session = %session_id, "ai_logs insert failed");
        }
    }

    /// Mirror a session row and the latest turn pair.
    pub fn mirror_turn(&self, session: &Session, user: &str, assistant: &str) {
        let conn = self.conn.lock().unwrap();
        let upsert = conn.execute(
            "INSERT INTO sessions (id, model, channel_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET model = ?2, updated_at = ?5",
            rusqlite::params![
                session.id,
                session.model,
                session.channel_id,
                session.created_at,
                session.updated_at
            ],
        );
        if let Err(e) = upsert {
            warn!(error = %e, session = %session.id, "session mirror failed");
            return;
        }
        let now = chrono::Utc::now().to_rfc3339();
        for (role, content) in [("user", user), ("assistant", assistant)] {
            if content.is_empty() {
                continue;
            }
            if let Err(e) = conn.execute(
                "INSERT INTO messages (session_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![session.id, role, content, now],
            ) {
                warn!(error = %e, session = %session.id, "message mirror failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.sqlite");
        let db = AuxDb::open(&path).unwrap();
        db.log_turn("sess_a", "openai/gpt-4o", 10, 20, 150);
        drop(db);

        // Reopen — second init must be a no-op and data must survive.
        let db = AuxDb::open(&path).unwrap();
        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM ai_logs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
