//! Schema migrations, gated on `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::info;

use crate::errors::Result;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS budget_ledger (
    thread_id      TEXT PRIMARY KEY,
    parent_id      TEXT,
    max_spend      REAL NOT NULL,
    reserved_spend REAL NOT NULL DEFAULT 0.0,
    actual_spend   REAL NOT NULL DEFAULT 0.0,
    status         TEXT NOT NULL DEFAULT 'active',
    final_status   TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_parent ON budget_ledger(parent_id);
CREATE INDEX IF NOT EXISTS idx_ledger_status ON budget_ledger(status);

CREATE TABLE IF NOT EXISTS threads (
    thread_id      TEXT PRIMARY KEY,
    parent_id      TEXT,
    task           TEXT NOT NULL,
    status         TEXT NOT NULL DEFAULT 'created',
    limits         TEXT NOT NULL,
    capabilities   TEXT NOT NULL,
    cost           TEXT NOT NULL,
    continued_by   TEXT,
    continued_from TEXT,
    chain_root     TEXT,
    result         TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    completed_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_threads_parent ON threads(parent_id);
CREATE INDEX IF NOT EXISTS idx_threads_status ON threads(status);
CREATE INDEX IF NOT EXISTS idx_threads_chain ON threads(chain_root);

CREATE TABLE IF NOT EXISTS thread_events (
    event_id   TEXT PRIMARY KEY,
    thread_id  TEXT NOT NULL,
    sequence   INTEGER NOT NULL,
    kind       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(thread_id, sequence)
);
CREATE INDEX IF NOT EXISTS idx_events_thread ON thread_events(thread_id, sequence);
";

/// Bring the schema up to the current version.
pub fn run_migrations(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
        info!(from = version, to = 1, "store schema migrated");
    }
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, new_in_memory};

    #[test]
    fn migrations_create_tables() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let version = run_migrations(&conn).unwrap();
        assert_eq!(version, 1);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('budget_ledger', 'threads', 'thread_events')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn migrations_are_idempotent() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let _ = run_migrations(&conn).unwrap();
        let version = run_migrations(&conn).unwrap();
        assert_eq!(version, 1);
    }
}
