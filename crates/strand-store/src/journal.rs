//! Append-only per-thread event log.
//!
//! The journal is the durable conversational record: user messages,
//! assistant text, tool calls/results, and lifecycle markers. Resume
//! reconstructs a thread's full conversation from it; handoff selects a
//! trailing window of it. `UNIQUE(thread_id, sequence)` enforces ordering
//! at the database level.

use parking_lot::Mutex;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use strand_core::ids::ThreadId;

use crate::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};

/// Kind of a journal event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A user (or injected) message — a turn boundary.
    UserMessage,
    /// Assistant text output.
    AssistantText,
    /// A requested tool invocation.
    ToolCall,
    /// A tool invocation's result (including structured denials).
    ToolResult,
    /// Lifecycle status marker.
    Status,
    /// Child spawn marker.
    Spawn,
    /// Continuation handoff marker.
    Handoff,
}

impl EventKind {
    /// SQL string representation.
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AssistantText => "assistant_text",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Status => "status",
            Self::Spawn => "spawn",
            Self::Handoff => "handoff",
        }
    }

    /// Parse the SQL string representation.
    pub fn from_sql(s: &str) -> Result<Self> {
        match s {
            "user_message" => Ok(Self::UserMessage),
            "assistant_text" => Ok(Self::AssistantText),
            "tool_call" => Ok(Self::ToolCall),
            "tool_result" => Ok(Self::ToolResult),
            "status" => Ok(Self::Status),
            "spawn" => Ok(Self::Spawn),
            "handoff" => Ok(Self::Handoff),
            other => Err(StoreError::Internal(format!("unknown event kind: {other}"))),
        }
    }
}

/// One journal row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEvent {
    /// Event id (`evt_` + UUIDv7, time-ordered).
    pub event_id: String,
    /// Owning thread.
    pub thread_id: String,
    /// Per-thread sequence number, starting at 1.
    pub sequence: i64,
    /// Event kind.
    pub kind: EventKind,
    /// JSON payload.
    pub payload: Value,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

/// SQLite-backed journal.
pub struct Journal {
    pool: ConnectionPool,
    write_lock: Mutex<()>,
}

impl Journal {
    /// Create a journal over an existing (migrated) pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Append an event, assigning the next sequence number atomically.
    #[instrument(skip(self, payload), fields(thread_id = %thread_id, kind = kind.as_sql()))]
    pub fn append(&self, thread_id: &ThreadId, kind: EventKind, payload: &Value) -> Result<i64> {
        let _guard = self.write_lock.lock();
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM thread_events WHERE thread_id = ?1",
            params![thread_id.as_str()],
            |r| r.get(0),
        )?;
        let _ = tx.execute(
            "INSERT INTO thread_events (event_id, thread_id, sequence, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                format!("evt_{}", Uuid::now_v7()),
                thread_id.as_str(),
                next,
                kind.as_sql(),
                serde_json::to_string(payload)?,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(next)
    }

    /// Full log for a thread, in sequence order.
    pub fn list(&self, thread_id: &ThreadId) -> Result<Vec<JournalEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, thread_id, sequence, kind, payload, created_at
             FROM thread_events WHERE thread_id = ?1 ORDER BY sequence",
        )?;
        let rows = stmt.query_map(params![thread_id.as_str()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?;
        rows.map(|r| {
            let (event_id, thread_id, sequence, kind, payload, created_at) = r?;
            Ok(JournalEvent {
                event_id,
                thread_id,
                sequence,
                kind: EventKind::from_sql(&kind)?,
                payload: serde_json::from_str(&payload)?,
                created_at,
            })
        })
        .collect()
    }

    /// Latest sequence number, 0 if the log is empty.
    pub fn head(&self, thread_id: &ThreadId) -> Result<i64> {
        let conn = self.conn()?;
        let head: Option<i64> = conn
            .query_row(
                "SELECT MAX(sequence) FROM thread_events WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |r| r.get(0),
            )
            .optional()?
            .flatten();
        Ok(head.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, new_in_memory};
    use crate::migrations::run_migrations;
    use serde_json::json;

    fn make_journal() -> Journal {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        Journal::new(pool)
    }

    fn tid(s: &str) -> ThreadId {
        ThreadId::parse(s).unwrap()
    }

    #[test]
    fn append_assigns_monotonic_sequence() {
        let journal = make_journal();
        let id = tid("t-1");
        assert_eq!(
            journal.append(&id, EventKind::UserMessage, &json!({"text": "hi"})).unwrap(),
            1
        );
        assert_eq!(
            journal
                .append(&id, EventKind::AssistantText, &json!({"text": "hello"}))
                .unwrap(),
            2
        );
        assert_eq!(journal.head(&id).unwrap(), 2);
    }

    #[test]
    fn sequences_are_per_thread() {
        let journal = make_journal();
        let _ = journal.append(&tid("a-1"), EventKind::UserMessage, &json!({})).unwrap();
        let seq = journal.append(&tid("b-1"), EventKind::UserMessage, &json!({})).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn list_returns_in_order_with_payloads() {
        let journal = make_journal();
        let id = tid("t-1");
        let _ = journal.append(&id, EventKind::UserMessage, &json!({"text": "do it"})).unwrap();
        let _ = journal
            .append(&id, EventKind::ToolCall, &json!({"tool": "fs/read", "callId": "c1"}))
            .unwrap();
        let _ = journal
            .append(&id, EventKind::ToolResult, &json!({"callId": "c1", "output": "ok"}))
            .unwrap();

        let events = journal.list(&id).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::UserMessage);
        assert_eq!(events[0].payload["text"], "do it");
        assert_eq!(events[1].kind, EventKind::ToolCall);
        assert_eq!(events[2].sequence, 3);
        assert!(events[0].event_id.starts_with("evt_"));
    }

    #[test]
    fn head_of_empty_log_is_zero() {
        let journal = make_journal();
        assert_eq!(journal.head(&tid("nothing-1")).unwrap(), 0);
    }

    #[test]
    fn kind_sql_roundtrip() {
        for kind in [
            EventKind::UserMessage,
            EventKind::AssistantText,
            EventKind::ToolCall,
            EventKind::ToolResult,
            EventKind::Status,
            EventKind::Spawn,
            EventKind::Handoff,
        ] {
            assert_eq!(EventKind::from_sql(kind.as_sql()).unwrap(), kind);
        }
    }
}
