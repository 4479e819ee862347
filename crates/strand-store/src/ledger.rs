//! Transactionally-consistent budget ledger.
//!
//! One row per thread tracking reserved vs. actual spend. Reservation is
//! the only operation requiring strict serializability: concurrent sibling
//! reservations against the same shrinking parent pool are processed under
//! an in-process write lock plus a single transaction, so two racing
//! children can never jointly overcommit.

use parking_lot::Mutex;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use strand_core::ids::ThreadId;

use crate::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};

const BUSY_MAX_RETRIES: u32 = 32;

/// One ledger row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Thread this entry belongs to.
    pub thread_id: String,
    /// Parent thread, `None` for roots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Spend ceiling for this thread's subtree.
    pub max_spend: f64,
    /// Committed allocation (collapses to `actual_spend` on release).
    pub reserved_spend: f64,
    /// Cost incurred by this thread plus cascaded cost from completed
    /// children.
    pub actual_spend: f64,
    /// `active` or `released`.
    pub status: String,
    /// Final thread status recorded at release time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<String>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

/// SQLite-backed budget ledger.
///
/// All mutation goes through [`Self::with_write`], which serializes
/// writers in-process and retries on `SQLITE_BUSY`.
pub struct BudgetLedger {
    pool: ConnectionPool,
    write_lock: Mutex<()>,
}

impl BudgetLedger {
    /// Create a ledger over an existing (migrated) pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    /// Run `f` with the write lock held, retrying on BUSY/LOCKED with
    /// linear backoff + jitter.
    fn with_write<T>(&self, mut f: impl FnMut(&PooledConnection) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut attempts = 0;
        loop {
            let conn = self.conn()?;
            match f(&conn) {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempts < BUSY_MAX_RETRIES => {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter = rand::random::<u64>() % (base_ms / 4 + 1);
                    std::thread::sleep(std::time::Duration::from_millis(base_ms + jitter));
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Create a root entry with a spend ceiling. Fails if the id exists.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn register(&self, thread_id: &ThreadId, max_spend: f64) -> Result<()> {
        self.with_write(|conn| {
            let now = now();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO budget_ledger
                 (thread_id, parent_id, max_spend, reserved_spend, actual_spend,
                  status, created_at, updated_at)
                 VALUES (?1, NULL, ?2, 0.0, 0.0, 'active', ?3, ?3)",
                params![thread_id.as_str(), max_spend, now],
            )?;
            if inserted == 0 {
                return Err(StoreError::DuplicateThread(thread_id.to_string()));
            }
            debug!(max_spend, "root budget registered");
            Ok(())
        })
    }

    /// Reserve `amount` for a child against its parent's remaining pool.
    ///
    /// Atomic: the read of the parent's current commitments and the child
    /// insert happen in one transaction under the write lock, so sibling
    /// races are processed as if sequential. On insufficient budget no row
    /// is created.
    #[instrument(skip(self), fields(thread_id = %thread_id, parent_id = %parent_id))]
    pub fn reserve(&self, thread_id: &ThreadId, amount: f64, parent_id: &ThreadId) -> Result<()> {
        self.with_write(|conn| {
            let tx = conn.unchecked_transaction()?;

            let remaining = remaining_in_tx(&tx, parent_id.as_str())?
                .ok_or_else(|| StoreError::ThreadNotFound(parent_id.to_string()))?;
            if amount > remaining {
                return Err(StoreError::InsufficientBudget {
                    requested: amount,
                    remaining,
                });
            }

            let now = now();
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO budget_ledger
                 (thread_id, parent_id, max_spend, reserved_spend, actual_spend,
                  status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3, 0.0, 'active', ?4, ?4)",
                params![thread_id.as_str(), parent_id.as_str(), amount, now],
            )?;
            if inserted == 0 {
                return Err(StoreError::DuplicateThread(thread_id.to_string()));
            }
            tx.commit()?;
            metrics::counter!("budget_reservations").increment(1);
            debug!(amount, remaining, "budget reserved");
            Ok(())
        })
    }

    /// Record the thread's own incurred cost, added to the running total
    /// so cascaded child spend already in the entry is preserved.
    ///
    /// Overspend (`total > reserved`) is a soft violation: logged as an
    /// anomaly, never blocking finalization. Reservations are advisory
    /// caps on intent, not a hard kernel limit.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn report_actual(&self, thread_id: &ThreadId, amount: f64) -> Result<()> {
        self.with_write(|conn| {
            let row: Option<(Option<String>, f64, f64, f64)> = conn
                .query_row(
                    "SELECT parent_id, max_spend, reserved_spend, actual_spend
                     FROM budget_ledger WHERE thread_id = ?1",
                    params![thread_id.as_str()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .optional()?;
            let (parent_id, max_spend, reserved, actual) =
                row.ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

            // Roots have no reservation; their cap is the ceiling itself.
            let cap = if parent_id.is_some() { reserved } else { max_spend };
            let total = actual + amount;
            if total > cap {
                warn!(total, cap, "overspend anomaly: actual exceeds reservation");
                metrics::counter!("budget_overspends").increment(1);
            }

            let _ = conn.execute(
                "UPDATE budget_ledger SET actual_spend = ?2, updated_at = ?3
                 WHERE thread_id = ?1",
                params![thread_id.as_str(), total, now()],
            )?;
            Ok(())
        })
    }

    /// Fold a child's realized cost into its parent's tally.
    #[instrument(skip(self), fields(child_id = %child_id, parent_id = %parent_id))]
    pub fn cascade_spend(
        &self,
        child_id: &ThreadId,
        parent_id: &ThreadId,
        amount: f64,
    ) -> Result<()> {
        self.with_write(|conn| {
            let updated = conn.execute(
                "UPDATE budget_ledger
                 SET actual_spend = actual_spend + ?2, updated_at = ?3
                 WHERE thread_id = ?1 AND status = 'active'",
                params![parent_id.as_str(), amount, now()],
            )?;
            if updated == 0 {
                return Err(StoreError::ThreadNotFound(parent_id.to_string()));
            }
            debug!(amount, child = %child_id, "spend cascaded to parent");
            Ok(())
        })
    }

    /// Finalize: collapse the reservation to actual spend, freeing the
    /// difference back to the parent's pool, and record the final status.
    /// Idempotent — releasing a released entry is a no-op.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn release(&self, thread_id: &ThreadId, final_status: &str) -> Result<()> {
        self.with_write(|conn| {
            let _ = conn.execute(
                "UPDATE budget_ledger
                 SET reserved_spend = actual_spend, status = 'released',
                     final_status = ?2, updated_at = ?3
                 WHERE thread_id = ?1 AND status = 'active'",
                params![thread_id.as_str(), final_status, now()],
            )?;
            Ok(())
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Remaining pool: `max_spend - actual_spend - sum(active children's
    /// reservations)`. `None` if the thread has no ledger entry.
    pub fn remaining(&self, thread_id: &ThreadId) -> Result<Option<f64>> {
        let conn = self.conn()?;
        remaining_in_tx(&conn, thread_id.as_str())
    }

    /// Whether a reservation of `requested` would currently fit.
    pub fn can_spawn(&self, parent_id: &ThreadId, requested: f64) -> Result<bool> {
        Ok(self
            .remaining(parent_id)?
            .is_some_and(|remaining| requested <= remaining))
    }

    /// Total realized spend across the subtree rooted at `thread_id`.
    ///
    /// A released child's spend is already cascaded into its ancestors,
    /// so the sum is this entry's actual plus the actuals of still-active
    /// descendants.
    pub fn tree_spend(&self, thread_id: &ThreadId) -> Result<f64> {
        let conn = self.conn()?;
        let own: Option<f64> = conn
            .query_row(
                "SELECT actual_spend FROM budget_ledger WHERE thread_id = ?1",
                params![thread_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        let own = own.ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

        let descendants: f64 = conn.query_row(
            "WITH RECURSIVE subtree(id) AS (
                 SELECT thread_id FROM budget_ledger WHERE parent_id = ?1
                 UNION ALL
                 SELECT b.thread_id FROM budget_ledger b
                 JOIN subtree s ON b.parent_id = s.id
             )
             SELECT COALESCE(SUM(actual_spend), 0.0) FROM budget_ledger
             WHERE thread_id IN (SELECT id FROM subtree) AND status = 'active'",
            params![thread_id.as_str()],
            |r| r.get(0),
        )?;

        Ok(own + descendants)
    }

    /// Fetch a full ledger row.
    pub fn entry(&self, thread_id: &ThreadId) -> Result<Option<LedgerEntry>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT thread_id, parent_id, max_spend, reserved_spend, actual_spend,
                    status, final_status, created_at, updated_at
             FROM budget_ledger WHERE thread_id = ?1",
            params![thread_id.as_str()],
            |r| {
                Ok(LedgerEntry {
                    thread_id: r.get(0)?,
                    parent_id: r.get(1)?,
                    max_spend: r.get(2)?,
                    reserved_spend: r.get(3)?,
                    actual_spend: r.get(4)?,
                    status: r.get(5)?,
                    final_status: r.get(6)?,
                    created_at: r.get(7)?,
                    updated_at: r.get(8)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }
}

/// Remaining pool computed inside the caller's transaction/connection.
fn remaining_in_tx(conn: &rusqlite::Connection, thread_id: &str) -> Result<Option<f64>> {
    let row: Option<(f64, f64)> = conn
        .query_row(
            "SELECT max_spend, actual_spend FROM budget_ledger
             WHERE thread_id = ?1 AND status = 'active'",
            params![thread_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((max_spend, actual_spend)) = row else {
        return Ok(None);
    };
    let children_reserved: f64 = conn.query_row(
        "SELECT COALESCE(SUM(reserved_spend), 0.0) FROM budget_ledger
         WHERE parent_id = ?1 AND status = 'active'",
        params![thread_id],
        |r| r.get(0),
    )?;
    Ok(Some(max_spend - actual_spend - children_reserved))
}

fn is_busy(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, new_in_memory, new_pool};
    use crate::migrations::run_migrations;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn make_ledger() -> BudgetLedger {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        BudgetLedger::new(pool)
    }

    fn tid(s: &str) -> ThreadId {
        ThreadId::parse(s).unwrap()
    }

    // --- Register / reserve ---

    #[test]
    fn register_root() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 3.0).unwrap();
        let entry = ledger.entry(&tid("root-1")).unwrap().unwrap();
        assert_eq!(entry.max_spend, 3.0);
        assert_eq!(entry.reserved_spend, 0.0);
        assert_eq!(entry.actual_spend, 0.0);
        assert_eq!(entry.status, "active");
    }

    #[test]
    fn register_duplicate_rejected() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 3.0).unwrap();
        assert_matches!(
            ledger.register(&tid("root-1"), 1.0),
            Err(StoreError::DuplicateThread(_))
        );
    }

    #[test]
    fn reserve_within_pool() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 3.0).unwrap();
        ledger.reserve(&tid("child-1"), 0.5, &tid("root-1")).unwrap();
        let entry = ledger.entry(&tid("child-1")).unwrap().unwrap();
        assert_eq!(entry.max_spend, 0.5);
        assert_eq!(entry.reserved_spend, 0.5);
        assert_eq!(ledger.remaining(&tid("root-1")).unwrap(), Some(2.5));
    }

    #[test]
    fn reserve_beyond_pool_rejected_without_row() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 1.0).unwrap();
        let result = ledger.reserve(&tid("child-1"), 1.5, &tid("root-1"));
        assert_matches!(result, Err(StoreError::InsufficientBudget { .. }));
        assert!(ledger.entry(&tid("child-1")).unwrap().is_none());
    }

    #[test]
    fn reserve_against_unknown_parent_rejected() {
        let ledger = make_ledger();
        assert_matches!(
            ledger.reserve(&tid("child-1"), 0.1, &tid("ghost-1")),
            Err(StoreError::ThreadNotFound(_))
        );
    }

    #[test]
    fn sibling_reservations_shrink_pool() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 1.0).unwrap();
        ledger.reserve(&tid("a-1"), 0.6, &tid("root-1")).unwrap();
        assert_matches!(
            ledger.reserve(&tid("b-1"), 0.6, &tid("root-1")),
            Err(StoreError::InsufficientBudget { .. })
        );
        ledger.reserve(&tid("b-2"), 0.4, &tid("root-1")).unwrap();
        assert_eq!(ledger.remaining(&tid("root-1")).unwrap(), Some(0.0));
    }

    // --- Report / cascade / release ---

    #[test]
    fn full_lifecycle_scenario() {
        // Spec scenario: root ceiling 3.00, child reserves 0.10, completes
        // with actual 0.07 → root actual 0.07, remaining 2.93.
        let ledger = make_ledger();
        let root = tid("root-1");
        let child = tid("child-1");

        ledger.register(&root, 3.0).unwrap();
        ledger.reserve(&child, 0.10, &root).unwrap();
        assert!((ledger.remaining(&root).unwrap().unwrap() - 2.90).abs() < 1e-9);

        ledger.report_actual(&child, 0.07).unwrap();
        ledger.cascade_spend(&child, &root, 0.07).unwrap();
        ledger.release(&child, "completed").unwrap();

        let root_entry = ledger.entry(&root).unwrap().unwrap();
        assert!((root_entry.actual_spend - 0.07).abs() < 1e-9);
        assert!((ledger.remaining(&root).unwrap().unwrap() - 2.93).abs() < 1e-9);

        let child_entry = ledger.entry(&child).unwrap().unwrap();
        assert_eq!(child_entry.status, "released");
        assert_eq!(child_entry.final_status.as_deref(), Some("completed"));
        assert!((child_entry.reserved_spend - 0.07).abs() < 1e-9);
    }

    #[test]
    fn overspend_is_soft() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 1.0).unwrap();
        ledger.reserve(&tid("child-1"), 0.1, &tid("root-1")).unwrap();
        // Exceeds the reservation; logged, not blocked.
        ledger.report_actual(&tid("child-1"), 0.25).unwrap();
        let entry = ledger.entry(&tid("child-1")).unwrap().unwrap();
        assert_eq!(entry.actual_spend, 0.25);
        ledger.release(&tid("child-1"), "completed").unwrap();
    }

    #[test]
    fn release_is_idempotent() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 1.0).unwrap();
        ledger.reserve(&tid("child-1"), 0.5, &tid("root-1")).unwrap();
        ledger.report_actual(&tid("child-1"), 0.2).unwrap();
        ledger.release(&tid("child-1"), "completed").unwrap();
        ledger.release(&tid("child-1"), "error").unwrap();
        let entry = ledger.entry(&tid("child-1")).unwrap().unwrap();
        // Second release did not overwrite the first final status.
        assert_eq!(entry.final_status.as_deref(), Some("completed"));
    }

    #[test]
    fn cascade_to_released_parent_fails() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 1.0).unwrap();
        ledger.release(&tid("root-1"), "completed").unwrap();
        assert_matches!(
            ledger.cascade_spend(&tid("c-1"), &tid("root-1"), 0.1),
            Err(StoreError::ThreadNotFound(_))
        );
    }

    // --- Budget conservation ---

    #[test]
    fn conservation_invariant_holds_throughout() {
        let ledger = make_ledger();
        let root = tid("root-1");
        ledger.register(&root, 2.0).unwrap();

        let check = |ledger: &BudgetLedger| {
            let entry = ledger.entry(&root).unwrap().unwrap();
            let remaining = ledger.remaining(&root).unwrap().unwrap();
            // remaining = max - actual - children_reserved >= 0 implies
            // children_reserved + actual <= max
            assert!(remaining >= -1e-9, "invariant violated: {entry:?}");
        };

        ledger.reserve(&tid("a-1"), 0.8, &root).unwrap();
        check(&ledger);
        ledger.reserve(&tid("b-1"), 0.8, &root).unwrap();
        check(&ledger);
        assert_matches!(
            ledger.reserve(&tid("c-1"), 0.8, &root),
            Err(StoreError::InsufficientBudget { .. })
        );
        check(&ledger);

        ledger.report_actual(&tid("a-1"), 0.5).unwrap();
        ledger.cascade_spend(&tid("a-1"), &root, 0.5).unwrap();
        ledger.release(&tid("a-1"), "completed").unwrap();
        check(&ledger);

        // Freed 0.3 from a's reservation: 2.0 - 0.5 - 0.8 = 0.7 remains
        ledger.reserve(&tid("c-2"), 0.7, &root).unwrap();
        check(&ledger);
    }

    // --- Concurrency ---

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let dir = tempfile::tempdir().unwrap();
        let pool = new_pool(&dir.path().join("ledger.db"), &ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        let ledger = Arc::new(BudgetLedger::new(pool));
        let root = tid("root-1");
        ledger.register(&root, 1.0).unwrap();

        // 8 threads race to reserve 0.3 each; only 3 can fit in 1.0.
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let root = root.clone();
                std::thread::spawn(move || {
                    let child = tid(&format!("child-{i}"));
                    ledger.reserve(&child, 0.3, &root).is_ok()
                })
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 3);
        let remaining = ledger.remaining(&root).unwrap().unwrap();
        assert!((remaining - 0.1).abs() < 1e-9);
    }

    #[test]
    fn two_racing_children_exceeding_pool_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let pool = new_pool(&dir.path().join("ledger.db"), &ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            let _ = run_migrations(&conn).unwrap();
        }
        let ledger = Arc::new(BudgetLedger::new(pool));
        let root = tid("root-1");
        ledger.register(&root, 1.0).unwrap();

        let handles: Vec<_> = ["a", "b"]
            .iter()
            .map(|name| {
                let ledger = Arc::clone(&ledger);
                let root = root.clone();
                let child = tid(&format!("{name}-1"));
                std::thread::spawn(move || ledger.reserve(&child, 0.7, &root).is_ok())
            })
            .collect();

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1, "exactly one of a+b > pool must win");
    }

    // --- Tree spend ---

    #[test]
    fn tree_spend_counts_active_descendants() {
        let ledger = make_ledger();
        let root = tid("root-1");
        ledger.register(&root, 10.0).unwrap();
        ledger.reserve(&tid("a-1"), 2.0, &root).unwrap();
        ledger.reserve(&tid("aa-1"), 1.0, &tid("a-1")).unwrap();

        ledger.report_actual(&tid("aa-1"), 0.4).unwrap();
        ledger.report_actual(&tid("a-1"), 0.3).unwrap();

        // root own 0.0 + active descendants 0.3 + 0.4
        assert!((ledger.tree_spend(&root).unwrap() - 0.7).abs() < 1e-9);

        // Once aa releases and cascades, its spend moves into a's actual.
        ledger.cascade_spend(&tid("aa-1"), &tid("a-1"), 0.4).unwrap();
        ledger.release(&tid("aa-1"), "completed").unwrap();
        assert!((ledger.tree_spend(&root).unwrap() - 0.7).abs() < 1e-9);
    }

    // --- Properties ---

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        #[test]
        fn random_reservation_sequences_never_overcommit(
            amounts in proptest::collection::vec(0.01f64..0.5, 1..12),
        ) {
            let ledger = make_ledger();
            let root = tid("root-1");
            ledger.register(&root, 1.0).unwrap();

            let mut reserved_total = 0.0;
            for (i, amount) in amounts.iter().enumerate() {
                let child = tid(&format!("c-{i}"));
                match ledger.reserve(&child, *amount, &root) {
                    Ok(()) => reserved_total += amount,
                    Err(StoreError::InsufficientBudget { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
                proptest::prop_assert!(reserved_total <= 1.0 + 1e-9);
                let remaining = ledger.remaining(&root).unwrap().unwrap();
                proptest::prop_assert!((remaining - (1.0 - reserved_total)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn can_spawn_reflects_remaining() {
        let ledger = make_ledger();
        ledger.register(&tid("root-1"), 1.0).unwrap();
        assert!(ledger.can_spawn(&tid("root-1"), 0.9).unwrap());
        ledger.reserve(&tid("a-1"), 0.9, &tid("root-1")).unwrap();
        assert!(!ledger.can_spawn(&tid("root-1"), 0.2).unwrap());
        assert!(ledger.can_spawn(&tid("root-1"), 0.1).unwrap());
    }
}
