//! Connection pool construction and pragmas.

use std::path::Path;
use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::Result;

/// Pooled connection type used throughout the crate.
pub type ConnectionPool = r2d2::Pool<SqliteConnectionManager>;
/// A checked-out connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Pool/connection tuning.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionConfig {
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// `SQLite` busy timeout per statement.
    pub busy_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    // journal_mode returns the resulting mode as a row; in-memory
    // databases report "memory" here, which is fine.
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |r| r.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Open a pool against an on-disk database, creating the file if needed.
pub fn new_pool(path: &Path, config: &ConnectionConfig) -> Result<ConnectionPool> {
    let busy = config.busy_timeout;
    let manager = SqliteConnectionManager::file(path)
        .with_init(move |conn| apply_pragmas(conn, busy));
    Ok(r2d2::Pool::builder()
        .max_size(config.max_connections)
        .build(manager)?)
}

/// Open an in-memory pool for tests.
///
/// Pinned to a single connection — separate in-memory connections would
/// each see their own database.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool> {
    let busy = config.busy_timeout;
    let manager =
        SqliteConnectionManager::memory().with_init(move |conn| apply_pragmas(conn, busy));
    Ok(r2d2::Pool::builder().max_size(1).build(manager)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pool_opens() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let one: i64 = conn.query_row("SELECT 1", [], |r| r.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn on_disk_pool_opens() {
        let dir = tempfile::tempdir().unwrap();
        let pool = new_pool(&dir.path().join("strand.db"), &ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
