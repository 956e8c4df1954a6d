//! SQLite-backed session memory.
//!
//! Every session owns an append-only event log (`session_events`) and a
//! materialized key/value state (`session_state`).  Appending an event and
//! applying its state delta happen in one transaction, so readers never see
//! one without the other.

use agentloom_workflow::{MemoryError, MemoryStore, SessionEvent, StateMap};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Summary row of a stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub event_count: i64,
    /// Unix timestamps in seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// [`MemoryStore`] persisted in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteMemory {
    db: Database,
}

impl SqliteMemory {
    /// Wrap an already migrated database.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Open the database file at `path`, migrating it if needed.
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        Ok(Self::new(Database::open_and_migrate(path).await?))
    }

    /// A fresh in-memory store.
    pub async fn in_memory() -> StoreResult<Self> {
        let db = Database::open_in_memory()?;
        db.run_migrations().await?;
        Ok(Self::new(db))
    }

    /// Append `event` to `session_id`, creating the session on first use.
    #[instrument(skip(self, event), fields(author = %event.author))]
    pub async fn append(&self, session_id: &str, event: SessionEvent) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let content = serde_json::to_string(&event.content)?;
        let delta = serde_json::to_string(&event.state_delta)?;
        let timestamp = event.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let now = Utc::now().timestamp();

        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO sessions (id, event_count, created_at, updated_at) VALUES (?1, 1, ?2, ?2) \
                     ON CONFLICT(id) DO UPDATE SET event_count = event_count + 1, updated_at = excluded.updated_at",
                    rusqlite::params![session_id, now],
                )?;
                tx.execute(
                    "INSERT INTO session_events (session_id, author, content, state_delta, timestamp) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![session_id, event.author, content, delta, timestamp],
                )?;
                for (key, value) in &event.state_delta {
                    if value.is_null() {
                        tx.execute(
                            "DELETE FROM session_state WHERE session_id = ?1 AND key = ?2",
                            rusqlite::params![session_id, key],
                        )?;
                    } else {
                        tx.execute(
                            "INSERT INTO session_state (session_id, key, value) VALUES (?1, ?2, ?3) \
                             ON CONFLICT(session_id, key) DO UPDATE SET value = excluded.value",
                            rusqlite::params![session_id, key, serde_json::to_string(value)?],
                        )?;
                    }
                }
                tx.commit()?;
                debug!(session_id = %session_id, "session event stored");
                Ok(())
            })
            .await
    }

    /// Current state of `session_id`; empty for unknown sessions.
    pub async fn state(&self, session_id: &str) -> StoreResult<StateMap> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value FROM session_state WHERE session_id = ?1 ORDER BY key",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![session_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut state = StateMap::new();
                for (key, raw) in rows {
                    state.insert(key, serde_json::from_str(&raw)?);
                }
                Ok(state)
            })
            .await
    }

    /// Every event of `session_id`, oldest first.
    #[instrument(skip(self))]
    pub async fn events(&self, session_id: &str) -> StoreResult<Vec<SessionEvent>> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                require_session(conn, &session_id)?;
                let mut stmt = conn.prepare(
                    "SELECT author, content, state_delta, timestamp FROM session_events \
                     WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![session_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                rows.into_iter()
                    .map(|(author, content, delta, timestamp)| -> StoreResult<SessionEvent> {
                        Ok(SessionEvent {
                            author,
                            content: serde_json::from_str::<Value>(&content)?,
                            state_delta: serde_json::from_str(&delta)?,
                            timestamp: parse_timestamp(&timestamp)?,
                        })
                    })
                    .collect()
            })
            .await
    }

    /// Summary of one session.
    pub async fn session(&self, session_id: &str) -> StoreResult<SessionInfo> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT id, event_count, created_at, updated_at FROM sessions WHERE id = ?1",
                    rusqlite::params![session_id],
                    session_row,
                )
                .optional()?
                .ok_or(StoreError::NotFound {
                    entity: "session",
                    id: session_id,
                })
            })
            .await
    }

    /// Stored sessions, most recently updated first.
    pub async fn list_sessions(&self) -> StoreResult<Vec<SessionInfo>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, event_count, created_at, updated_at FROM sessions \
                     ORDER BY updated_at DESC, id ASC",
                )?;
                let sessions = stmt
                    .query_map([], session_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(sessions)
            })
            .await
    }

    /// Remove a session with its events and state.
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> StoreResult<()> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM sessions WHERE id = ?1",
                    rusqlite::params![session_id],
                )?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "session",
                        id: session_id,
                    });
                }
                debug!(session_id = %session_id, "session deleted");
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl MemoryStore for SqliteMemory {
    async fn add_message(&self, session_id: &str, event: SessionEvent) -> Result<(), MemoryError> {
        Ok(self.append(session_id, event).await?)
    }

    async fn full_state(&self, session_id: &str) -> Result<StateMap, MemoryError> {
        Ok(self.state(session_id).await?)
    }
}

fn require_session(conn: &Connection, session_id: &str) -> StoreResult<()> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sessions WHERE id = ?1",
            rusqlite::params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(StoreError::NotFound {
            entity: "session",
            id: session_id.to_string(),
        }),
    }
}

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionInfo> {
    Ok(SessionInfo {
        id: row.get(0)?,
        event_count: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("event timestamp `{raw}`: {e}")))
}
