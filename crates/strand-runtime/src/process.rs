//! Detached OS-process execution contract.
//!
//! An asynchronous thread may run as a separate OS process with its own
//! memory and control flow. The contract is: the worker is started from
//! the current executable with the thread id in its environment, and all
//! results flow through the persisted registry/ledger — never shared
//! memory. The embedding binary is expected to check
//! [`detached_thread_id`] at startup and, when set, run that thread to
//! completion instead of its normal entry path.

use tokio::process::{Child, Command};
use tracing::info;

use strand_core::ids::ThreadId;

use crate::errors::{Result, RuntimeError};

/// Environment variable carrying the thread id into a worker process.
pub const THREAD_ID_ENV: &str = "STRAND_THREAD_ID";

/// Environment variable carrying the store path into a worker process.
pub const STORE_PATH_ENV: &str = "STRAND_STORE_PATH";

/// Launch a detached worker for `thread_id` against the store at
/// `store_path`. Returns the child handle; the caller tracks completion
/// through the registry, not the process exit.
pub fn launch_detached(thread_id: &ThreadId, store_path: &str) -> Result<Child> {
    let exe = std::env::current_exe()
        .map_err(|e| RuntimeError::ProcessLaunch(format!("current_exe: {e}")))?;
    let child = Command::new(exe)
        .env(THREAD_ID_ENV, thread_id.as_str())
        .env(STORE_PATH_ENV, store_path)
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| RuntimeError::ProcessLaunch(e.to_string()))?;
    info!(thread_id = %thread_id, pid = child.id(), "detached worker launched");
    Ok(child)
}

/// In a worker process: the thread id this process was launched to run.
#[must_use]
pub fn detached_thread_id() -> Option<ThreadId> {
    std::env::var(THREAD_ID_ENV)
        .ok()
        .and_then(|raw| ThreadId::parse(&raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_thread_id_absent_by_default() {
        // The variable is not set in the test environment.
        if std::env::var(THREAD_ID_ENV).is_err() {
            assert!(detached_thread_id().is_none());
        }
    }
}
