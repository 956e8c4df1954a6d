//! Versioned schema migrations.
//!
//! Applied versions are recorded in `_migrations`; each pending migration
//! runs in its own transaction, so a failed one leaves the schema at the
//! previous version.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append new migrations at the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "sessions, their event log and materialized state",
        sql: r#"
            CREATE TABLE sessions (
                id          TEXT PRIMARY KEY,
                event_count INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE session_events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                author      TEXT NOT NULL,
                content     TEXT NOT NULL,
                state_delta TEXT NOT NULL DEFAULT '{}',
                timestamp   TEXT NOT NULL
            );
            CREATE INDEX idx_session_events_session ON session_events(session_id, id);

            CREATE TABLE session_state (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                PRIMARY KEY (session_id, key)
            );
        "#,
    },
];

/// Bring `conn` up to the latest schema version.  Synchronous; call it from
/// the blocking pool.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!(current_version = current, "session schema is up to date");
        return Ok(());
    }

    info!(current_version = current, pending = pending.len(), "running migrations");
    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Latest applied version, or 0 for a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );
    let failed = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    // `transaction()` needs `&mut Connection`; manage it by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| failed(format!("failed to begin transaction: {e}")))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| failed(format!("SQL execution failed: {e}")))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| failed(format!("failed to record migration: {e}")))
        });

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT;")
            .map_err(|e| failed(format!("failed to commit: {e}"))),
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            if let Err(e) = conn.execute_batch("ROLLBACK;") {
                warn!(version = migration.version, error = %e, "rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LATEST_VERSION: u32 = 1;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    #[test]
    fn versions_strictly_increase() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[1].version > pair[0].version);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(LATEST_VERSION));
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);

        let recorded: i64 = conn
            .query_row("SELECT count(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(recorded, i64::from(LATEST_VERSION));
    }

    #[test]
    fn events_cascade_with_their_session() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO sessions (id, created_at, updated_at) VALUES ('s', 0, 0);
             INSERT INTO session_events (session_id, author, content, timestamp)
                 VALUES ('s', 'user', '\"hi\"', '2026-01-01T00:00:00Z');
             INSERT INTO session_state (session_id, key, value) VALUES ('s', 'k', '1');
             DELETE FROM sessions WHERE id = 's';",
        )
        .unwrap();

        let left: i64 = conn
            .query_row(
                "SELECT (SELECT count(*) FROM session_events) + (SELECT count(*) FROM session_state)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn events_require_a_session() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        let orphan = conn.execute(
            "INSERT INTO session_events (session_id, author, content, timestamp) \
             VALUES ('ghost', 'user', 'null', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(orphan.is_err());
    }
}
