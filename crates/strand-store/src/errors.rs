//! Store-layer errors.

use thiserror::Error;

/// Convenience result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the ledger, registry, and journal.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool failure.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON (de)serialization of a persisted column failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An entry already exists for this thread id.
    #[error("duplicate thread: {0}")]
    DuplicateThread(String),

    /// No row for the given thread id.
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    /// A reservation exceeded the parent's remaining pool.
    #[error("insufficient budget: requested {requested:.4}, remaining {remaining:.4}")]
    InsufficientBudget {
        /// Amount requested.
        requested: f64,
        /// Parent pool remainder at decision time.
        remaining: f64,
    },

    /// Invariant violation or lock poisoning.
    #[error("internal store error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_budget_message() {
        let err = StoreError::InsufficientBudget {
            requested: 1.0,
            remaining: 0.2,
        };
        let msg = err.to_string();
        assert!(msg.contains("1.0"));
        assert!(msg.contains("0.2"));
    }
}
