//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

/// Migration to version 1: cached collections, outbox and metadata
fn migrate_v1(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS groups (
            id TEXT PRIMARY KEY,
            parent_id TEXT,
            data TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            pending INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_groups_cached_at ON groups(cached_at);

        CREATE TABLE IF NOT EXISTS expenses (
            id TEXT PRIMARY KEY,
            parent_id TEXT,
            data TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            pending INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_expenses_cached_at ON expenses(cached_at);
        CREATE INDEX IF NOT EXISTS idx_expenses_parent ON expenses(parent_id);

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            parent_id TEXT,
            data TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            pending INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_users_cached_at ON users(cached_at);

        CREATE TABLE IF NOT EXISTS pending_actions (
            id TEXT PRIMARY KEY,
            action_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_pending_actions_created ON pending_actions(created_at);

        CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: retained failed actions and update base snapshots
fn migrate_v2(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "ALTER TABLE pending_actions ADD COLUMN status TEXT NOT NULL DEFAULT 'pending';
        ALTER TABLE pending_actions ADD COLUMN base TEXT;
        CREATE INDEX IF NOT EXISTS idx_pending_actions_status
            ON pending_actions(status, created_at);
        INSERT INTO schema_version (version) VALUES (2);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: action revisions, bumped by every amend
fn migrate_v3(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "ALTER TABLE pending_actions ADD COLUMN revision INTEGER NOT NULL DEFAULT 0;
        INSERT INTO schema_version (version) VALUES (3);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_migrations() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_layout_has_named_collections() {
        let mut conn = setup();
        run(&mut conn).unwrap();

        for table in ["groups", "expenses", "users", "pending_actions", "metadata"] {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }

    #[test]
    fn test_outbox_rows_start_at_revision_zero() {
        let mut conn = setup();
        run(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO pending_actions (id, action_type, payload, created_at) VALUES ('a1', 'CREATE_GROUP', '{}', 0)",
            [],
        )
        .unwrap();

        let revision: i64 = conn
            .query_row("SELECT revision FROM pending_actions WHERE id = 'a1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(revision, 0);
    }
}
