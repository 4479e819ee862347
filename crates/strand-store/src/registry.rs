//! Durable thread records.
//!
//! One row per thread: status, resolved limits, capability set, cost
//! accumulator, continuation pointers, result, timestamps. This is the
//! contract audit tooling and cross-process waiters read. Records become
//! immutable once terminal, except `continued_by`, which may be set once
//! post-terminal to link a successor.

use parking_lot::Mutex;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use strand_core::capability::Capability;
use strand_core::cost::CostTracker;
use strand_core::ids::ThreadId;
use strand_core::limits::Limits;

use crate::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};

/// Thread lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Registered; limits, budget, and capabilities resolved.
    Created,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an unrecovered error.
    Error,
    /// Externally cancelled.
    Cancelled,
    /// Terminal for this thread; a successor carries the task forward.
    Continued,
}

impl ThreadStatus {
    /// Whether this status ends the thread's own execution.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::Cancelled | Self::Continued
        )
    }

    /// SQL string representation.
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Continued => "continued",
        }
    }

    /// Parse the SQL string representation.
    pub fn from_sql(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            "continued" => Ok(Self::Continued),
            other => Err(StoreError::Internal(format!("unknown status: {other}"))),
        }
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A persisted thread record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    /// Thread id.
    pub thread_id: String,
    /// Parent thread, `None` for roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Logical task name.
    pub task: String,
    /// Lifecycle status.
    pub status: ThreadStatus,
    /// Resolved limits.
    pub limits: Limits,
    /// Effective capability set.
    pub capabilities: Vec<Capability>,
    /// Accumulated cost.
    pub cost: CostTracker,
    /// Successor in the continuation chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continued_by: Option<String>,
    /// Predecessor in the continuation chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continued_from: Option<String>,
    /// First thread of the chain this record belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_root: Option<String>,
    /// Final result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
    /// Terminal timestamp (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Parameters for registering a thread.
#[derive(Clone, Debug)]
pub struct RegisterThread<'a> {
    /// Thread id.
    pub thread_id: &'a ThreadId,
    /// Parent id, `None` for roots.
    pub parent_id: Option<&'a ThreadId>,
    /// Logical task name.
    pub task: &'a str,
    /// Resolved limits.
    pub limits: &'a Limits,
    /// Effective capability set.
    pub capabilities: &'a [Capability],
    /// Chain root inherited from a predecessor, if any.
    pub chain_root: Option<&'a str>,
    /// Predecessor in a continuation chain, if any.
    pub continued_from: Option<&'a str>,
}

/// SQLite-backed thread registry.
pub struct ThreadRegistry {
    pool: ConnectionPool,
    write_lock: Mutex<()>,
}

impl ThreadRegistry {
    /// Create a registry over an existing (migrated) pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Register a new thread in `created` status.
    #[instrument(skip(self, params), fields(thread_id = %params.thread_id))]
    pub fn register(&self, params: &RegisterThread<'_>) -> Result<()> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let now = now();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO threads
             (thread_id, parent_id, task, status, limits, capabilities, cost,
              chain_root, continued_from, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'created', ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                params.thread_id.as_str(),
                params.parent_id.map(ThreadId::as_str),
                params.task,
                serde_json::to_string(params.limits)?,
                serde_json::to_string(params.capabilities)?,
                serde_json::to_string(&CostTracker::default())?,
                params.chain_root,
                params.continued_from,
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateThread(params.thread_id.to_string()));
        }
        debug!(task = params.task, "thread registered");
        Ok(())
    }

    /// Transition a thread's status. Terminal statuses also stamp
    /// `completed_at`. Transitions out of a terminal status are rejected —
    /// terminal records are immutable apart from the continuation pointer.
    #[instrument(skip(self), fields(thread_id = %thread_id, status = %status))]
    pub fn update_status(&self, thread_id: &ThreadId, status: ThreadStatus) -> Result<()> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let current = self.status_with_conn(&conn, thread_id)?;
        if current.is_terminal() {
            return Err(StoreError::Internal(format!(
                "thread {thread_id} is terminal ({current}); cannot transition to {status}"
            )));
        }
        let now = now();
        let completed_at = status.is_terminal().then(|| now.clone());
        let _ = conn.execute(
            "UPDATE threads SET status = ?2, updated_at = ?3,
                 completed_at = COALESCE(?4, completed_at)
             WHERE thread_id = ?1",
            params![thread_id.as_str(), status.as_sql(), now, completed_at],
        )?;
        Ok(())
    }

    /// Persist the current cost accumulator.
    pub fn record_cost(&self, thread_id: &ThreadId, cost: &CostTracker) -> Result<()> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE threads SET cost = ?2, updated_at = ?3 WHERE thread_id = ?1",
            params![thread_id.as_str(), serde_json::to_string(cost)?, now()],
        )?;
        if updated == 0 {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    /// Store the final result payload.
    pub fn set_result(&self, thread_id: &ThreadId, result: &Value) -> Result<()> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE threads SET result = ?2, updated_at = ?3 WHERE thread_id = ?1",
            params![thread_id.as_str(), serde_json::to_string(result)?, now()],
        )?;
        if updated == 0 {
            return Err(StoreError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(())
    }

    /// Link a successor to a (terminal) predecessor.
    ///
    /// The forward pointer may be set only once; a second link attempt
    /// fails rather than silently rewriting chain history.
    #[instrument(skip(self), fields(predecessor = %predecessor, successor = %successor))]
    pub fn link_continuation(
        &self,
        predecessor: &ThreadId,
        successor: &ThreadId,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE threads SET continued_by = ?2, updated_at = ?3
             WHERE thread_id = ?1 AND continued_by IS NULL",
            params![predecessor.as_str(), successor.as_str(), now()],
        )?;
        if updated == 0 {
            return Err(StoreError::Internal(format!(
                "thread {predecessor} already has a successor or does not exist"
            )));
        }
        Ok(())
    }

    /// Fetch a full record.
    pub fn get(&self, thread_id: &ThreadId) -> Result<Option<ThreadRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT thread_id, parent_id, task, status, limits, capabilities, cost,
                    continued_by, continued_from, chain_root, result,
                    created_at, updated_at, completed_at
             FROM threads WHERE thread_id = ?1",
            params![thread_id.as_str()],
            row_to_record,
        )
        .optional()
        .map_err(StoreError::from)?
        .map(finish_record)
        .transpose()
    }

    /// Current status, erroring for unknown threads.
    pub fn status(&self, thread_id: &ThreadId) -> Result<ThreadStatus> {
        let conn = self.conn()?;
        self.status_with_conn(&conn, thread_id)
    }

    fn status_with_conn(
        &self,
        conn: &rusqlite::Connection,
        thread_id: &ThreadId,
    ) -> Result<ThreadStatus> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM threads WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        match status {
            Some(s) => ThreadStatus::from_sql(&s),
            None => Err(StoreError::ThreadNotFound(thread_id.to_string())),
        }
    }

    /// All children of a thread, oldest first.
    pub fn list_children(&self, parent_id: &ThreadId) -> Result<Vec<ThreadRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT thread_id, parent_id, task, status, limits, capabilities, cost,
                    continued_by, continued_from, chain_root, result,
                    created_at, updated_at, completed_at
             FROM threads WHERE parent_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![parent_id.as_str()], row_to_record)?;
        rows.map(|r| finish_record(r?))
            .collect::<Result<Vec<_>>>()
    }

    /// All threads not yet terminal, newest first.
    pub fn list_active(&self) -> Result<Vec<ThreadRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT thread_id, parent_id, task, status, limits, capabilities, cost,
                    continued_by, continued_from, chain_root, result,
                    created_at, updated_at, completed_at
             FROM threads WHERE status IN ('created', 'running')
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        rows.map(|r| finish_record(r?))
            .collect::<Result<Vec<_>>>()
    }
}

/// Intermediate row with JSON columns still raw.
struct RawRecord {
    thread_id: String,
    parent_id: Option<String>,
    task: String,
    status: String,
    limits: String,
    capabilities: String,
    cost: String,
    continued_by: Option<String>,
    continued_from: Option<String>,
    chain_root: Option<String>,
    result: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn row_to_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        thread_id: r.get(0)?,
        parent_id: r.get(1)?,
        task: r.get(2)?,
        status: r.get(3)?,
        limits: r.get(4)?,
        capabilities: r.get(5)?,
        cost: r.get(6)?,
        continued_by: r.get(7)?,
        continued_from: r.get(8)?,
        chain_root: r.get(9)?,
        result: r.get(10)?,
        created_at: r.get(11)?,
        updated_at: r.get(12)?,
        completed_at: r.get(13)?,
    })
}

fn finish_record(raw: RawRecord) -> Result<ThreadRecord> {
    Ok(ThreadRecord {
        thread_id: raw.thread_id,
        parent_id: raw.parent_id,
        task: raw.task,
        status: ThreadStatus::from_sql(&raw.status)?,
        limits: serde_json::from_str(&raw.limits)?,
        capabilities: serde_json::from_str(&raw.capabilities)?,
        cost: serde_json::from_str(&raw.cost)?,
        continued_by: raw.continued_by,
        continued_from: raw.continued_from,
        chain_root: raw.chain_root,
        result: raw.result.map(|s| serde_json::from_str(&s)).transpose()?,
        created_at: raw.created_at,
        updated_at: raw.updated_at,
        completed_at: raw.completed_at,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}
