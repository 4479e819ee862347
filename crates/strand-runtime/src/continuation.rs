//! Continuation: handoff, chain resolution, and user resume.
//!
//! A resource-exhausted thread hands its task to a successor linked
//! through `continued_by`/`continued_from` pointers; waits transparently
//! resolve to the final link. Chains are acyclic by construction but the
//! walk is cycle-guarded anyway, since persisted state could in principle
//! be corrupted.

use std::collections::HashSet;

use futures::future::BoxFuture;
use serde_json::{Value, json};
use tracing::{info, warn};

use strand_core::errors::StrandError;
use strand_core::ids::ThreadId;
use strand_store::journal::{EventKind, JournalEvent};
use strand_store::registry::{ThreadRecord, ThreadRegistry, ThreadStatus};

use crate::delegate::ThreadState;
use crate::errors::{Result, RuntimeError};
use crate::supervisor::{
    ChainLink, RunCtx, SpawnMode, SpawnRequest, Supervisor, TaskDefinition, ThreadHandle,
};

/// Directive seeded into a successor spawned by automatic handoff.
const HANDOFF_DIRECTIVE: &str =
    "Continue the task from the carried-over context. Prior work is summarized above.";

// ─────────────────────────────────────────────────────────────────────────────
// Chain walking
// ─────────────────────────────────────────────────────────────────────────────

/// Walk forward pointers while status is `continued`, returning the first
/// thread that is not. A cycle is flagged and resolved defensively by
/// returning the node at which it was detected.
pub fn resolve_tip(registry: &ThreadRegistry, thread_id: &ThreadId) -> Result<ThreadId> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = thread_id.clone();
    loop {
        let _ = visited.insert(current.to_string());
        let record = registry
            .get(&current)?
            .ok_or_else(|| StrandError::ThreadNotFound(current.to_string()))?;
        let next = match (record.status, record.continued_by) {
            (ThreadStatus::Continued, Some(next)) => next,
            _ => return Ok(current),
        };
        if visited.contains(&next) {
            warn!(thread_id = %current, next = %next, "continuation chain cycle detected");
            metrics::counter!("strand_chain_corruptions").increment(1);
            return Ok(current);
        }
        current = ThreadId::parse(&next)?;
    }
}

/// The full chain containing `thread_id`, from chain root to tip.
pub fn chain(registry: &ThreadRegistry, thread_id: &ThreadId) -> Result<Vec<ThreadRecord>> {
    let record = registry
        .get(thread_id)?
        .ok_or_else(|| StrandError::ThreadNotFound(thread_id.to_string()))?;

    // Walk back to the chain root (guarded like the forward walk).
    let mut root = thread_id.clone();
    if let Some(chain_root) = record.chain_root.as_deref() {
        root = ThreadId::parse(chain_root)?;
    } else {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = record;
        while let Some(prev) = current.continued_from.clone() {
            if !visited.insert(prev.clone()) {
                warn!(thread_id = %prev, "backward chain cycle detected");
                break;
            }
            let prev_id = ThreadId::parse(&prev)?;
            match registry.get(&prev_id)? {
                Some(prev_record) => {
                    root = prev_id;
                    current = prev_record;
                }
                None => break,
            }
        }
    }

    // Walk forward from the root, collecting records.
    let mut records = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = root;
    loop {
        if !visited.insert(current.to_string()) {
            warn!(thread_id = %current, "forward chain cycle detected");
            break;
        }
        let Some(record) = registry.get(&current)? else {
            break;
        };
        let next = record.continued_by.clone();
        records.push(record);
        match next {
            Some(next) => current = ThreadId::parse(&next)?,
            None => break,
        }
    }
    Ok(records)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handoff
// ─────────────────────────────────────────────────────────────────────────────

/// Hand off a context-exhausted thread to a successor.
///
/// Protocol: summarize work-to-date (delegate-optional), select a trailing
/// journal window under the configured token ceiling beginning at a turn
/// boundary, spawn a successor with the same task and parent seeded with
/// summary + window, link the chain pointers, and let the caller mark the
/// predecessor `continued`.
//
// Returns a boxed future rather than an `async fn` opaque type on purpose:
// `hand_off` calls back into `Supervisor::spawn`, which (in background mode)
// must prove the run future `Send` for `tokio::spawn`. With an `async fn`
// opaque here, that proof recurses into the opaque type being defined and
// rustc bails ("fetching the hidden types of an opaque inside of the
// defining scope is not supported"). A concrete `BoxFuture` is `Send` by its
// declared type, which cuts the recursion at the `execute_loop` await point.
pub(crate) fn hand_off<'a>(
    supervisor: &'a Supervisor,
    ctx: &'a RunCtx,
) -> BoxFuture<'a, Result<ThreadId>> {
    Box::pin(async move {
    let predecessor = ctx.thread_id.clone();

    let state = ThreadState {
        thread_id: predecessor.to_string(),
        task: ctx.task.name.clone(),
        turn: ctx.cost.turns,
        messages: ctx.messages.clone(),
    };
    let summary = supervisor.delegate.summarize(&state).await;

    let events = supervisor.journal.list(&predecessor)?;
    let window = trailing_window(
        &events,
        supervisor.config.trailing_window_tokens,
        supervisor.config.chars_per_token,
    );

    let mut seed_messages = Vec::new();
    if let Some(summary) = &summary {
        seed_messages.push(json!({
            "role": "user",
            "content": format!("Summary of prior work:\n{summary}"),
        }));
    }
    seed_messages.extend(events_to_messages(window));

    let pred_record = supervisor
        .registry
        .get(&predecessor)?
        .ok_or_else(|| StrandError::ThreadNotFound(predecessor.to_string()))?;
    let chain_root = pred_record
        .chain_root
        .unwrap_or_else(|| predecessor.to_string());

    let request = SpawnRequest {
        task: ctx.task.clone(),
        input: HANDOFF_DIRECTIVE.to_string(),
        parent_id: ctx.parent_id.clone(),
        overrides: strand_core::limits::Limits::default(),
        mode: SpawnMode::Background,
        seed_messages,
        chain: Some(ChainLink {
            root: chain_root,
            from: predecessor.to_string(),
        }),
    };

    let _ = supervisor.journal.append(
        &predecessor,
        EventKind::Handoff,
        &json!({"summarized": summary.is_some(), "windowEvents": window.len()}),
    )?;

    // Boxed to break the spawn → run → hand_off → spawn future cycle.
    let sup = supervisor.clone();
    let fut: BoxFuture<'static, Result<ThreadHandle>> =
        Box::pin(async move { sup.spawn(request).await });
    let handle = fut.await?;

    supervisor
        .registry
        .link_continuation(&predecessor, &handle.thread_id)?;
    metrics::counter!("strand_handoffs").increment(1);
    info!(predecessor = %predecessor, successor = %handle.thread_id, "handoff linked");

    Ok(handle.thread_id)
    })
}

/// Select the trailing slice of journal events whose estimated token sum
/// fits the ceiling, trimmed so it begins with a turn boundary (a
/// `user_message` event). Returns an empty slice when no boundary fits.
pub(crate) fn trailing_window(
    events: &[JournalEvent],
    token_ceiling: u64,
    chars_per_token: u64,
) -> &[JournalEvent] {
    let mut start = events.len();
    let mut tokens: u64 = 0;
    while start > 0 {
        let estimate = estimate_tokens(&events[start - 1], chars_per_token);
        if tokens + estimate > token_ceiling {
            break;
        }
        tokens += estimate;
        start -= 1;
    }
    // Trim forward to the first turn boundary inside the budgeted slice.
    while start < events.len() && events[start].kind != EventKind::UserMessage {
        start += 1;
    }
    &events[start..]
}

fn estimate_tokens(event: &JournalEvent, chars_per_token: u64) -> u64 {
    let chars = event
        .payload
        .get("text")
        .or_else(|| event.payload.get("output"))
        .and_then(Value::as_str)
        .map_or_else(|| event.payload.to_string().len(), str::len);
    (chars as u64).div_ceil(chars_per_token.max(1))
}

/// Rebuild conversation messages from journal events.
pub(crate) fn events_to_messages(events: &[JournalEvent]) -> Vec<Value> {
    events
        .iter()
        .filter_map(|event| match event.kind {
            EventKind::UserMessage => Some(json!({
                "role": "user",
                "content": event.payload.get("text").cloned().unwrap_or(Value::Null),
            })),
            EventKind::AssistantText => Some(json!({
                "role": "assistant",
                "content": event.payload.get("text").cloned().unwrap_or(Value::Null),
            })),
            EventKind::ToolCall => Some(json!({
                "role": "assistant",
                "content": "",
                "toolCalls": [event.payload.clone()],
            })),
            EventKind::ToolResult => Some(json!({
                "role": "tool",
                "callId": event.payload.get("callId").cloned().unwrap_or(Value::Null),
                "content": event.payload.get("output").cloned().unwrap_or(Value::Null),
            })),
            EventKind::Status | EventKind::Spawn | EventKind::Handoff => None,
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// User resume
// ─────────────────────────────────────────────────────────────────────────────

impl Supervisor {
    /// Resume a terminal thread with a new user directive.
    ///
    /// Distinct from automatic handoff: the full conversation is
    /// reconstructed from the journal (no summarization), the directive
    /// is appended, and a chain-linked successor runs in the background.
    pub async fn resume(&self, thread_id: &ThreadId, message: &str) -> Result<ThreadHandle> {
        let record = self
            .registry
            .get(thread_id)?
            .ok_or_else(|| StrandError::ThreadNotFound(thread_id.to_string()))?;

        if !record.status.is_terminal() || record.status == ThreadStatus::Continued {
            return Err(RuntimeError::NotResumable {
                thread_id: thread_id.to_string(),
                status: record.status.to_string(),
            });
        }

        let events = self.journal.list(thread_id)?;
        let seed_messages = events_to_messages(&events);

        let parent_id = record
            .parent_id
            .as_deref()
            .map(ThreadId::parse)
            .transpose()
            .map_err(RuntimeError::from)?;
        let request = SpawnRequest {
            task: TaskDefinition {
                name: record.task.clone(),
                limits: record.limits.clone(),
                capabilities: record.capabilities.clone(),
                context_window_tokens: None,
            },
            input: message.to_string(),
            parent_id,
            overrides: strand_core::limits::Limits::default(),
            mode: SpawnMode::Background,
            seed_messages,
            chain: Some(ChainLink {
                root: record
                    .chain_root
                    .clone()
                    .unwrap_or_else(|| thread_id.to_string()),
                from: thread_id.to_string(),
            }),
        };

        let handle = self.spawn(request).await?;
        self.registry.link_continuation(thread_id, &handle.thread_id)?;
        info!(predecessor = %thread_id, successor = %handle.thread_id, "thread resumed");
        Ok(handle)
    }

    /// The full continuation chain containing `thread_id`.
    pub fn chain(&self, thread_id: &ThreadId) -> Result<Vec<ThreadRecord>> {
        chain(&self.registry, thread_id)
    }

    /// The chain tip for `thread_id` (itself, if never continued).
    pub fn resolve(&self, thread_id: &ThreadId) -> Result<ThreadId> {
        resolve_tip(&self.registry, thread_id)
    }
}
