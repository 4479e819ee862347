//! Error taxonomy shared across the orchestrator.
//!
//! Permission and budget failures are decided locally and never silently
//! downgraded; limit and execution errors are offered to the hook engine
//! before a fail-safe terminal transition is applied.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which resolved limit a breach refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    /// LLM turn count.
    Turns,
    /// Total token count.
    Tokens,
    /// Spend ceiling in USD.
    Spend,
    /// Wall-clock duration in seconds.
    Duration,
    /// Child spawn count.
    Spawns,
    /// Remaining nesting depth.
    Depth,
}

impl LimitKind {
    /// Stable string form used in event payloads and hook contexts.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Turns => "turns",
            Self::Tokens => "tokens",
            Self::Spend => "spend",
            Self::Duration => "duration",
            Self::Spawns => "spawns",
            Self::Depth => "depth",
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core orchestrator errors.
#[derive(Debug, Error)]
pub enum StrandError {
    /// Capability check failed. Terminal for the attempted action and
    /// non-retryable; the reason names the missing capability so the
    /// caller can decide whether to retry with broader scope.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Human-readable denial naming the missing capability.
        reason: String,
    },

    /// Budget reservation failed; terminal for the spawn attempt.
    #[error("insufficient budget: requested {requested:.4}, remaining {remaining:.4}")]
    InsufficientBudget {
        /// Amount the child asked to reserve.
        requested: f64,
        /// What the parent's pool had left.
        remaining: f64,
    },

    /// Spawn would exceed the permitted nesting depth. Raised before any
    /// ledger or registry mutation.
    #[error("spawn depth exhausted (parent depth {parent_depth})")]
    DepthExhausted {
        /// The parent's remaining depth at spawn time.
        parent_depth: i64,
    },

    /// A resolved limit was reached.
    #[error("limit exceeded: {kind} at {current} (max {max})")]
    LimitExceeded {
        /// Which limit.
        kind: LimitKind,
        /// Observed value.
        current: f64,
        /// Resolved ceiling.
        max: f64,
    },

    /// Execution failure classified as retryable.
    #[error("transient execution error ({category}): {message}")]
    TransientExecution {
        /// Classification category (e.g. `rate_limit`, `network`).
        category: String,
        /// Underlying message.
        message: String,
    },

    /// Execution failure that surfaces immediately.
    #[error("execution error: {0}")]
    PermanentExecution(String),

    /// Continuation pointers form a cycle. The walk returns the current
    /// node instead of looping; flagged for operator attention.
    #[error("continuation chain corrupt at {thread_id}")]
    ChainCorruption {
        /// Node at which the cycle was detected.
        thread_id: String,
    },

    /// No registry entry for the given thread.
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    /// Thread name/id failed validation.
    #[error("invalid thread id: {0:?}")]
    InvalidThreadId(String),

    /// Capability pattern failed to parse.
    #[error("invalid capability pattern: {0:?}")]
    InvalidCapability(String),
}

impl StrandError {
    /// Whether the error may be retried (possibly after backoff).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientExecution { .. })
    }
}
