//! Test doubles for the delegate seams.
//!
//! Used by this crate's tests and by downstream integration tests; kept
//! out of `#[cfg(test)]` so embedding crates can drive a supervisor
//! without a live provider.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use strand_core::cost::TurnUsage;

use crate::classify::ErrorClassifier;
use crate::delegate::{
    ActionRequest, DelegateError, ExecutionDelegate, ThreadState, ToolDispatcher, TurnOutcome,
};
use crate::hooks::HookEngine;
use crate::settings::OrchestratorConfig;
use crate::supervisor::Supervisor;

/// A delegate that replays a scripted sequence of turns, then completes.
pub struct ScriptedDelegate {
    turns: Mutex<VecDeque<Result<TurnOutcome, DelegateError>>>,
    summary: Option<String>,
}

impl ScriptedDelegate {
    /// Replay the given turns in order; once exhausted, every further
    /// turn completes with empty output.
    #[must_use]
    pub fn new(turns: Vec<Result<TurnOutcome, DelegateError>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            summary: None,
        }
    }

    /// Also answer summarize requests with `summary`.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

#[async_trait]
impl ExecutionDelegate for ScriptedDelegate {
    async fn run_turn(&self, _state: &ThreadState) -> Result<TurnOutcome, DelegateError> {
        self.turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(done("")))
    }

    async fn summarize(&self, _state: &ThreadState) -> Option<String> {
        self.summary.clone()
    }
}

/// A dispatcher that records calls and returns a fixed payload.
#[derive(Default)]
pub struct RecordingDispatcher {
    /// `(resource_type, resource_id, params)` per dispatched call.
    pub calls: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl ToolDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        resource_type: &str,
        resource_id: &str,
        params: &Value,
    ) -> Result<Value, String> {
        self.calls.lock().push((
            resource_type.to_string(),
            resource_id.to_string(),
            params.clone(),
        ));
        Ok(json!({"ok": true}))
    }
}

/// A completing turn with no requested actions.
#[must_use]
pub fn done(text: &str) -> TurnOutcome {
    TurnOutcome {
        text: text.to_string(),
        requests: vec![],
        usage: TurnUsage::default(),
    }
}

/// A turn requesting a single tool call.
#[must_use]
pub fn tool_turn(call_id: &str, resource_id: &str, usage: TurnUsage) -> TurnOutcome {
    TurnOutcome {
        text: String::new(),
        requests: vec![ActionRequest {
            call_id: call_id.to_string(),
            action: "execute".to_string(),
            resource_type: "tool".to_string(),
            resource_id: resource_id.to_string(),
            params: json!({}),
        }],
        usage,
    }
}

/// A supervisor over a fresh in-memory store with the given doubles.
#[must_use]
pub fn supervisor_with(
    delegate: Arc<dyn ExecutionDelegate>,
    dispatcher: Arc<dyn ToolDispatcher>,
    hooks: HookEngine,
    config: OrchestratorConfig,
) -> Supervisor {
    let pool = strand_store::new_in_memory(&strand_store::ConnectionConfig::default())
        .expect("in-memory pool");
    {
        let conn = pool.get().expect("connection");
        let _ = strand_store::migrations::run_migrations(&conn).expect("migrations");
    }
    Supervisor::new(
        pool,
        delegate,
        dispatcher,
        hooks,
        ErrorClassifier::builtin(),
        config,
    )
}
