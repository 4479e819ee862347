//! Runtime-layer errors.

use thiserror::Error;

use strand_core::errors::StrandError;
use strand_store::StoreError;

/// Convenience result alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors from the supervisor, continuation manager, and process layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Core-layer error (permissions, limits, depth, chains).
    #[error(transparent)]
    Core(#[from] StrandError),

    /// Store-layer error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A wait deadline elapsed before the watched threads finished.
    #[error("wait timed out after {waited_ms}ms ({pending} thread(s) pending)")]
    WaitTimeout {
        /// Milliseconds waited.
        waited_ms: u64,
        /// How many threads were still unfinished.
        pending: usize,
    },

    /// Resume was requested for a thread that is not in a terminal state.
    #[error("thread {thread_id} is not resumable (status {status})")]
    NotResumable {
        /// The thread in question.
        thread_id: String,
        /// Its current status.
        status: String,
    },

    /// Failed to launch a detached worker process.
    #[error("failed to launch detached process: {0}")]
    ProcessLaunch(String),

    /// A background task panicked or was aborted.
    #[error("background execution failed: {0}")]
    Background(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_pass_through() {
        let err = RuntimeError::from(StrandError::PermissionDenied {
            reason: "missing capability strand.execute.tool.x".into(),
        });
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn wait_timeout_reports_pending() {
        let err = RuntimeError::WaitTimeout {
            waited_ms: 5000,
            pending: 2,
        };
        assert!(err.to_string().contains("2 thread(s)"));
    }
}
