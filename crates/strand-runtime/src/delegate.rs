//! Seams to external collaborators.
//!
//! The execution delegate is the reasoning agent: the supervisor does not
//! define its protocol, only consumes usage numbers for limit checks and
//! action requests for permission checks. The tool dispatcher is invoked
//! only after a capability check passes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strand_core::cost::TurnUsage;

/// Conversation state handed to the delegate each turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadState {
    /// Thread id.
    pub thread_id: String,
    /// Logical task name.
    pub task: String,
    /// 1-based turn number about to run.
    pub turn: u64,
    /// Conversation messages (`{"role": ..., "content": ...}` objects).
    pub messages: Vec<Value>,
}

/// An action the reasoning agent requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// Correlation id for the eventual result.
    pub call_id: String,
    /// Primary action (`execute`, `load`, `search`, ...).
    pub action: String,
    /// Resource type (`tool`, `knowledge`, ...).
    pub resource_type: String,
    /// Resource id, `/`-separated (`fs/read`, `web/search`).
    pub resource_id: String,
    /// Action parameters.
    pub params: Value,
}

/// What one turn produced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    /// Assistant text output.
    pub text: String,
    /// Requested actions; an empty list ends the thread with `text` as
    /// its result.
    pub requests: Vec<ActionRequest>,
    /// Token/spend usage for the turn. `input_tokens` doubles as the
    /// current context size for handoff detection.
    pub usage: TurnUsage,
}

/// A delegate failure, carrying a structured context document for the
/// error classifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateError {
    /// Human-readable message.
    pub message: String,
    /// Classification context (`{"error": {"type": ..., ...}}`).
    pub context: Value,
}

impl std::fmt::Display for DelegateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DelegateError {}

/// The reasoning-agent call.
#[async_trait]
pub trait ExecutionDelegate: Send + Sync {
    /// Run one unit of work against the current thread state.
    async fn run_turn(&self, state: &ThreadState) -> Result<TurnOutcome, DelegateError>;

    /// Summarize work-to-date for a continuation handoff. `None` skips
    /// the summary step.
    async fn summarize(&self, _state: &ThreadState) -> Option<String> {
        None
    }
}

/// Uniform tool dispatch, invoked only after a capability check passes.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// Execute a tool and return its result payload.
    async fn dispatch(
        &self,
        resource_type: &str,
        resource_id: &str,
        params: &Value,
    ) -> Result<Value, String>;
}

/// Verify-before-load boundary for task/artifact sources.
///
/// The supervisor trusts the pass/fail result and never re-implements
/// verification; embedders route every [`TaskDefinition`] load through
/// this gate before handing the definition to
/// [`Supervisor::spawn`](crate::supervisor::Supervisor::spawn).
///
/// [`TaskDefinition`]: crate::supervisor::TaskDefinition
#[async_trait]
pub trait IntegrityVerifier: Send + Sync {
    /// Verify an artifact, returning its content hash on success.
    async fn verify_before_load(&self, path: &str) -> Result<String, String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_request_serde_camel_case() {
        let req = ActionRequest {
            call_id: "c1".into(),
            action: "execute".into(),
            resource_type: "tool".into(),
            resource_id: "fs/read".into(),
            params: json!({"path": "/tmp/x"}),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["callId"], "c1");
        assert_eq!(json["resourceType"], "tool");
        assert_eq!(json["resourceId"], "fs/read");
    }

    #[test]
    fn turn_outcome_roundtrip() {
        let outcome = TurnOutcome {
            text: "done".into(),
            requests: vec![],
            usage: TurnUsage {
                input_tokens: 10,
                output_tokens: 5,
                spend: 0.001,
            },
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: TurnOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text, "done");
        assert_eq!(back.usage.input_tokens, 10);
    }
}
