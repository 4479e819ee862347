//! Thread lifecycle supervisor.
//!
//! Owns the spawn pipeline (limits → capabilities → budget → registration),
//! the per-thread execution loop, the guaranteed four-step finalization,
//! and wait/cancel coordination across in-process and cross-process
//! threads.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use strand_core::capability::{self, Capability, CheckOutcome};
use strand_core::cost::CostTracker;
use strand_core::errors::StrandError;
use strand_core::errors::LimitKind;
use strand_core::ids::ThreadId;
use strand_core::limits::{self, Limits};
use strand_store::connection::ConnectionPool;
use strand_store::journal::{EventKind, Journal};
use strand_store::ledger::BudgetLedger;
use strand_store::registry::{RegisterThread, ThreadRecord, ThreadRegistry, ThreadStatus};

use crate::classify::ErrorClassifier;
use crate::continuation;
use crate::delegate::{ExecutionDelegate, ThreadState, ToolDispatcher};
use crate::errors::{Result, RuntimeError};
use crate::hooks::{HookAction, HookEngine};
use crate::process;
use crate::settings::OrchestratorConfig;

/// What to run: a task definition as loaded from its (verified) source.
#[derive(Clone, Debug, Default)]
pub struct TaskDefinition {
    /// Logical task name; becomes the thread id prefix.
    pub name: String,
    /// Limits declared by the task.
    pub limits: Limits,
    /// Capabilities declared by the task. Empty means inherit.
    pub capabilities: Vec<Capability>,
    /// Model context window override for handoff detection.
    pub context_window_tokens: Option<u64>,
}

/// How to run a spawned thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SpawnMode {
    /// Run in the caller's task and return the final outcome.
    #[default]
    Inline,
    /// Run on a spawned tokio task; results through the store + handle.
    Background,
    /// Run in a separate OS process; results only through the store.
    Detached,
}

/// A spawn request.
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    /// The task to run.
    pub task: TaskDefinition,
    /// Initial user input.
    pub input: String,
    /// Explicit parent, `None` for roots.
    pub parent_id: Option<ThreadId>,
    /// Caller-supplied limit overrides.
    pub overrides: Limits,
    /// Execution mode.
    pub mode: SpawnMode,
    /// Seed conversation (used by handoff and resume).
    pub seed_messages: Vec<Value>,
    /// Chain linkage (used by handoff and resume).
    pub chain: Option<ChainLink>,
}

impl SpawnRequest {
    /// A plain spawn of `task` with the given input.
    #[must_use]
    pub fn new(task: TaskDefinition, input: impl Into<String>) -> Self {
        Self {
            task,
            input: input.into(),
            parent_id: None,
            overrides: Limits::default(),
            mode: SpawnMode::Inline,
            seed_messages: Vec::new(),
            chain: None,
        }
    }
}

/// Continuation-chain linkage carried on a successor's spawn.
#[derive(Clone, Debug)]
pub struct ChainLink {
    /// First thread of the chain.
    pub root: String,
    /// Immediate predecessor.
    pub from: String,
}

/// Final outcome of a thread's own execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadOutcome {
    /// The thread.
    pub thread_id: ThreadId,
    /// Terminal status.
    pub status: ThreadStatus,
    /// Result payload.
    pub result: Value,
}

/// Handle returned by [`Supervisor::spawn`].
#[derive(Clone, Debug)]
pub struct ThreadHandle {
    /// The spawned thread.
    pub thread_id: ThreadId,
    /// Present when the thread ran inline.
    pub outcome: Option<ThreadOutcome>,
}

/// Wait mode for [`Supervisor::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Wait for every listed thread.
    All,
    /// Return as soon as any listed thread finishes.
    Any,
}

struct ActiveRun {
    cancel: CancellationToken,
    done: Arc<Notify>,
}

pub(crate) struct RunCtx {
    pub(crate) thread_id: ThreadId,
    pub(crate) task: TaskDefinition,
    pub(crate) parent_id: Option<ThreadId>,
    pub(crate) limits: Limits,
    pub(crate) capabilities: Vec<Capability>,
    pub(crate) cost: CostTracker,
    pub(crate) messages: Vec<Value>,
    pub(crate) cancel: CancellationToken,
    started: Instant,
    limit_grace: HashSet<LimitKind>,
    retry_attempts: u32,
}

/// Multi-thread supervisor.
///
/// Cheap to clone — all state is behind `Arc`s; background runs hold
/// their own clone.
#[derive(Clone)]
pub struct Supervisor {
    pub(crate) ledger: Arc<BudgetLedger>,
    pub(crate) registry: Arc<ThreadRegistry>,
    pub(crate) journal: Arc<Journal>,
    pub(crate) delegate: Arc<dyn ExecutionDelegate>,
    dispatcher: Arc<dyn ToolDispatcher>,
    hooks: Arc<HookEngine>,
    classifier: Arc<ErrorClassifier>,
    pub(crate) config: Arc<OrchestratorConfig>,
    active: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl Supervisor {
    /// Create a supervisor over a migrated connection pool.
    pub fn new(
        pool: ConnectionPool,
        delegate: Arc<dyn ExecutionDelegate>,
        dispatcher: Arc<dyn ToolDispatcher>,
        hooks: HookEngine,
        classifier: ErrorClassifier,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger: Arc::new(BudgetLedger::new(pool.clone())),
            registry: Arc::new(ThreadRegistry::new(pool.clone())),
            journal: Arc::new(Journal::new(pool)),
            delegate,
            dispatcher,
            hooks: Arc::new(hooks),
            classifier: Arc::new(classifier),
            config: Arc::new(config),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spawn pipeline
    // ─────────────────────────────────────────────────────────────────────

    /// Spawn a thread.
    ///
    /// Ordering is load-bearing: limit resolution fails depth-exhausted
    /// spawns before any side effect; budget reservation fails before
    /// registration; only a registered thread ever executes.
    #[instrument(skip(self, request), fields(task = %request.task.name))]
    pub async fn spawn(&self, request: SpawnRequest) -> Result<ThreadHandle> {
        let parent = match &request.parent_id {
            Some(pid) => Some(
                self.registry
                    .get(pid)?
                    .ok_or_else(|| StrandError::ThreadNotFound(pid.to_string()))?,
            ),
            None => None,
        };

        // 1. Limits — DepthExhausted aborts with zero side effects.
        let resolved = limits::resolve(
            &self.config.default_limits,
            &request.task.limits,
            &request.overrides,
            parent.as_ref().map(|p| &p.limits),
        )?;

        // 2. Capabilities.
        let parent_caps = parent.as_ref().map_or(&[][..], |p| p.capabilities.as_slice());
        let effective = capability::attenuate(parent_caps, &request.task.capabilities);

        // 3. Budget — reservation failure aborts before registration.
        let thread_id = ThreadId::mint(&request.task.name)?;
        match &request.parent_id {
            None => {
                let ceiling = resolved.spend.unwrap_or(self.config.default_root_budget);
                self.ledger.register(&thread_id, ceiling)?;
            }
            Some(pid) => {
                let amount = resolved
                    .spend
                    .unwrap_or(self.config.default_child_reservation);
                self.ledger.reserve(&thread_id, amount, pid)?;
            }
        }

        // 4. Registration.
        self.registry.register(&RegisterThread {
            thread_id: &thread_id,
            parent_id: request.parent_id.as_ref(),
            task: &request.task.name,
            limits: &resolved,
            capabilities: &effective,
            chain_root: request.chain.as_ref().map(|c| c.root.as_str()),
            continued_from: request.chain.as_ref().map(|c| c.from.as_str()),
        })?;
        let _ = self.journal.append(
            &thread_id,
            EventKind::Spawn,
            &json!({
                "task": &request.task.name,
                "parent": request.parent_id.as_ref().map(ThreadId::as_str),
                "mode": format!("{:?}", request.mode),
            }),
        )?;
        let _ = self.journal.append(
            &thread_id,
            EventKind::UserMessage,
            &json!({"text": &request.input}),
        )?;
        info!(thread_id = %thread_id, "thread spawned");

        match request.mode {
            SpawnMode::Inline => {
                let ctx = self.build_run_ctx(thread_id.clone(), &request, resolved, effective);
                let outcome = self.run_thread(ctx).await?;
                Ok(ThreadHandle {
                    thread_id,
                    outcome: Some(outcome),
                })
            }
            SpawnMode::Background => {
                let ctx = self.build_run_ctx(thread_id.clone(), &request, resolved, effective);
                let this = self.clone();
                drop(tokio::spawn(async move {
                    if let Err(err) = this.run_thread(ctx).await {
                        warn!(error = %err, "background thread failed");
                    }
                }));
                Ok(ThreadHandle {
                    thread_id,
                    outcome: None,
                })
            }
            SpawnMode::Detached => {
                let store_path = self.config.store_path.clone().ok_or_else(|| {
                    RuntimeError::ProcessLaunch("no store path configured".into())
                })?;
                let _child = process::launch_detached(&thread_id, &store_path)?;
                Ok(ThreadHandle {
                    thread_id,
                    outcome: None,
                })
            }
        }
    }

    fn build_run_ctx(
        &self,
        thread_id: ThreadId,
        request: &SpawnRequest,
        limits: Limits,
        capabilities: Vec<Capability>,
    ) -> RunCtx {
        let mut messages = request.seed_messages.clone();

        // Context-injection hooks build the up-front framing.
        let hook_ctx = json!({
            "task": &request.task.name,
            "limits": &limits,
            "thread_id": thread_id.as_str(),
        });
        if let Some(injected) = self.hooks.inject("thread_started", &hook_ctx) {
            messages.push(json!({"role": "user", "content": injected}));
        }
        messages.push(json!({"role": "user", "content": &request.input}));

        RunCtx {
            thread_id,
            task: request.task.clone(),
            parent_id: request.parent_id.clone(),
            limits,
            capabilities,
            cost: CostTracker::default(),
            messages,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            limit_grace: HashSet::new(),
            retry_attempts: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────

    /// Run a registered thread to a terminal status, with guaranteed
    /// finalization on every exit path.
    pub(crate) async fn run_thread(&self, mut ctx: RunCtx) -> Result<ThreadOutcome> {
        let thread_id = ctx.thread_id.clone();
        self.registry.update_status(&thread_id, ThreadStatus::Running)?;

        let done = Arc::new(Notify::new());
        {
            let mut active = self.active.lock();
            let _ = active.insert(
                thread_id.to_string(),
                ActiveRun {
                    cancel: ctx.cancel.clone(),
                    done: Arc::clone(&done),
                },
            );
            gauge!("strand_threads_active").set(active.len() as f64);
        }

        let (status, result) = match self.execute_loop(&mut ctx).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(thread_id = %thread_id, error = %err, "execution loop failed");
                (
                    ThreadStatus::Error,
                    json!({"success": false, "error": err.to_string()}),
                )
            }
        };

        let finalized = self.finalize(&ctx, status, result);

        {
            let mut active = self.active.lock();
            let _ = active.remove(thread_id.as_str());
            gauge!("strand_threads_active").set(active.len() as f64);
        }
        done.notify_waiters();

        let (status, result) = finalized?;
        Ok(ThreadOutcome {
            thread_id,
            status,
            result,
        })
    }

    async fn execute_loop(&self, ctx: &mut RunCtx) -> Result<(ThreadStatus, Value)> {
        loop {
            // Cancellation is observed at the top of every unit of work.
            if ctx.cancel.is_cancelled() {
                return Ok((
                    ThreadStatus::Cancelled,
                    json!({"success": false, "status": "cancelled"}),
                ));
            }

            ctx.cost.elapsed_seconds = ctx.started.elapsed().as_secs_f64();

            // Pre-turn limit check, routed through hooks first.
            if let Some(breach) = ctx.cost.breach(&ctx.limits) {
                if let Some((status, result)) = self.handle_limit_breach(ctx, breach) {
                    return Ok((status, result));
                }
                // A hook granted one-shot grace; fall through to the turn.
            }

            let state = ThreadState {
                thread_id: ctx.thread_id.to_string(),
                task: ctx.task.name.clone(),
                turn: ctx.cost.turns + 1,
                messages: ctx.messages.clone(),
            };

            let outcome = match self.delegate.run_turn(&state).await {
                Ok(outcome) => {
                    ctx.retry_attempts = 0;
                    outcome
                }
                Err(derr) => {
                    match self.handle_delegate_error(ctx, &derr).await {
                        ErrorVerdict::Retry => continue,
                        ErrorVerdict::Fail(result) => return Ok((ThreadStatus::Error, result)),
                    }
                }
            };

            ctx.cost.charge_turn(&outcome.usage);
            self.registry.record_cost(&ctx.thread_id, &ctx.cost)?;
            if !outcome.text.is_empty() {
                let _ = self.journal.append(
                    &ctx.thread_id,
                    EventKind::AssistantText,
                    &json!({"text": &outcome.text}),
                )?;
            }

            // No requested actions: the thread is done.
            if outcome.requests.is_empty() {
                return Ok((
                    ThreadStatus::Completed,
                    json!({"success": true, "text": outcome.text}),
                ));
            }

            ctx.messages.push(json!({
                "role": "assistant",
                "content": &outcome.text,
                "toolCalls": &outcome.requests,
            }));

            // Every privileged action is capability-checked before dispatch.
            for request in &outcome.requests {
                let _ = self.journal.append(
                    &ctx.thread_id,
                    EventKind::ToolCall,
                    &json!({
                        "callId": &request.call_id,
                        "action": &request.action,
                        "resourceType": &request.resource_type,
                        "resourceId": &request.resource_id,
                        "input": &request.params,
                    }),
                )?;

                let check = capability::check(
                    &ctx.capabilities,
                    &request.action,
                    &request.resource_type,
                    &request.resource_id,
                );
                let (content, error) = match check {
                    CheckOutcome::Denied { reason } => {
                        counter!("strand_permission_denials").increment(1);
                        debug!(thread_id = %ctx.thread_id, %reason, "action denied");
                        (format!("permission denied: {reason}"), true)
                    }
                    CheckOutcome::Allowed => {
                        match self
                            .dispatcher
                            .dispatch(&request.resource_type, &request.resource_id, &request.params)
                            .await
                        {
                            Ok(value) => (value.to_string(), false),
                            Err(message) => (format!("tool error: {message}"), true),
                        }
                    }
                };

                let _ = self.journal.append(
                    &ctx.thread_id,
                    EventKind::ToolResult,
                    &json!({"callId": &request.call_id, "output": &content, "error": error}),
                )?;
                ctx.messages.push(json!({
                    "role": "tool",
                    "callId": &request.call_id,
                    "content": content,
                    "error": error,
                }));
            }

            // Context-exhaustion detection: hand off to a successor.
            let window = ctx
                .task
                .context_window_tokens
                .unwrap_or(self.config.context_window_tokens);
            let fraction = outcome.usage.input_tokens as f64 / window as f64;
            if fraction >= self.config.handoff_threshold {
                info!(
                    thread_id = %ctx.thread_id,
                    fraction, "context threshold crossed; handing off"
                );
                let successor = continuation::hand_off(self, ctx).await?;
                return Ok((
                    ThreadStatus::Continued,
                    json!({"success": true, "continuedBy": successor.as_str()}),
                ));
            }

            // Post-turn hooks may still suspend or escalate.
            let after_ctx = json!({
                "event": {"name": "after_turn"},
                "cost": ctx.cost.to_json(),
                "task": &ctx.task.name,
            });
            if let Some(decision) = self.hooks.decide("after_turn", &after_ctx) {
                match decision.action {
                    HookAction::Suspend => {
                        return Ok((
                            ThreadStatus::Cancelled,
                            json!({"success": false, "status": "suspended", "hook": decision.hook_id}),
                        ));
                    }
                    HookAction::Escalate => {
                        return Ok((
                            ThreadStatus::Error,
                            json!({"success": false, "error": "escalated by hook", "hook": decision.hook_id}),
                        ));
                    }
                    _ => {}
                }
            }
        }
    }

    /// Route a limit breach through hooks. Returns the terminal pair, or
    /// `None` when a hook granted one-shot grace for this limit kind.
    fn handle_limit_breach(
        &self,
        ctx: &mut RunCtx,
        breach: strand_core::cost::LimitBreach,
    ) -> Option<(ThreadStatus, Value)> {
        let event_ctx = json!({
            "event": {
                "name": "limit",
                "code": format!("{}_exceeded", breach.kind),
                "current": breach.current,
                "max": breach.max,
            },
            "cost": ctx.cost.to_json(),
            "limits": &ctx.limits,
            "task": &ctx.task.name,
        });

        let decision = self.hooks.decide("limit", &event_ctx);
        if let Some(decision) = &decision {
            for effect in &decision.side_effects {
                if let HookAction::Emit { event } = effect {
                    let _ = self.journal.append(
                        &ctx.thread_id,
                        EventKind::Status,
                        &json!({"emitted": event, "on": "limit"}),
                    );
                }
            }
        }

        match decision.map(|d| d.action) {
            // One-shot grace: the same limit kind fails terminally next time.
            Some(HookAction::Retry) if !ctx.limit_grace.contains(&breach.kind) => {
                let _ = ctx.limit_grace.insert(breach.kind);
                debug!(kind = %breach.kind, "limit breach granted one-shot grace by hook");
                None
            }
            Some(HookAction::Suspend) => Some((
                ThreadStatus::Cancelled,
                json!({"success": false, "status": "suspended", "limit": breach.kind.as_str()}),
            )),
            _ => {
                let err = StrandError::LimitExceeded {
                    kind: breach.kind,
                    current: breach.current,
                    max: breach.max,
                };
                Some((
                    ThreadStatus::Error,
                    json!({"success": false, "error": err.to_string(), "limit": breach.kind.as_str()}),
                ))
            }
        }
    }

    async fn handle_delegate_error(
        &self,
        ctx: &mut RunCtx,
        derr: &crate::delegate::DelegateError,
    ) -> ErrorVerdict {
        let classification = self.classifier.classify(&derr.context);
        warn!(
            thread_id = %ctx.thread_id,
            category = %classification.category,
            error = %derr.message,
            "delegate error"
        );

        if classification.retryable && classification.retry.should_retry(ctx.retry_attempts) {
            ctx.retry_attempts += 1;
            let delay = classification.retry.delay_for_attempt(ctx.retry_attempts);
            tokio::time::sleep(delay).await;
            return ErrorVerdict::Retry;
        }

        // Hooks get a chance to claim the error before the fail-safe.
        let event_ctx = json!({
            "event": {"name": "error", "code": &classification.category},
            "error": derr.context.get("error").cloned().unwrap_or(Value::Null),
            "cost": ctx.cost.to_json(),
            "task": &ctx.task.name,
        });
        if let Some(decision) = self.hooks.decide("error", &event_ctx) {
            if decision.action == HookAction::Retry {
                ctx.retry_attempts = 0;
                return ErrorVerdict::Retry;
            }
        }

        let err = if classification.retryable {
            StrandError::TransientExecution {
                category: classification.category,
                message: derr.message.clone(),
            }
        } else {
            StrandError::PermanentExecution(derr.message.clone())
        };
        ErrorVerdict::Fail(json!({"success": false, "error": err.to_string()}))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Finalization
    // ─────────────────────────────────────────────────────────────────────

    /// The four-step finalization: report actual spend, cascade to the
    /// parent, release the ledger entry, persist the final status.
    /// Mandatory for the ledger; best-effort for journal side channels.
    fn finalize(
        &self,
        ctx: &RunCtx,
        status: ThreadStatus,
        result: Value,
    ) -> Result<(ThreadStatus, Value)> {
        let mut status = status;
        let mut result = result;

        if self.config.overspend_is_fatal {
            if let Some(entry) = self.ledger.entry(&ctx.thread_id)? {
                // Roots have no reservation; their cap is the ceiling.
                let cap = if entry.parent_id.is_some() {
                    entry.reserved_spend
                } else {
                    entry.max_spend
                };
                if ctx.cost.spend > cap {
                    status = ThreadStatus::Error;
                    result = json!({
                        "success": false,
                        "error": format!(
                            "overspend: {:.4} against reservation {:.4}",
                            ctx.cost.spend, cap
                        ),
                    });
                }
            }
        }

        self.ledger.report_actual(&ctx.thread_id, ctx.cost.spend)?;
        if let Some(parent_id) = &ctx.parent_id {
            if let Err(err) = self
                .ledger
                .cascade_spend(&ctx.thread_id, parent_id, ctx.cost.spend)
            {
                // The parent may already be released (e.g. cancelled while
                // this child was finishing). Its pool no longer exists, so
                // there is nothing to return the spend to.
                warn!(parent = %parent_id, error = %err, "cascade skipped");
            }
        }
        self.ledger.release(&ctx.thread_id, status.as_sql())?;

        if let Err(err) = self.registry.record_cost(&ctx.thread_id, &ctx.cost) {
            warn!(error = %err, "cost record failed during finalization");
        }
        if let Err(err) = self.registry.set_result(&ctx.thread_id, &result) {
            warn!(error = %err, "result record failed during finalization");
        }
        self.registry.update_status(&ctx.thread_id, status)?;
        if let Err(err) = self.journal.append(
            &ctx.thread_id,
            EventKind::Status,
            &json!({"status": status.as_sql(), "cost": ctx.cost.to_json()}),
        ) {
            warn!(error = %err, "status journal failed during finalization");
        }

        info!(thread_id = %ctx.thread_id, status = %status, spend = ctx.cost.spend, "thread finalized");
        Ok((status, result))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Coordination
    // ─────────────────────────────────────────────────────────────────────

    /// Request cancellation. Returns whether an in-process run observed
    /// the request. With `cascade_cancel` set, children are cancelled too.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn cancel(&self, thread_id: &ThreadId) -> bool {
        let hit = {
            let active = self.active.lock();
            if let Some(run) = active.get(thread_id.as_str()) {
                warn!(thread_id = %thread_id, "cancellation requested");
                run.cancel.cancel();
                true
            } else {
                false
            }
        };
        if self.config.cascade_cancel {
            if let Ok(children) = self.registry.list_children(thread_id) {
                for child in children {
                    if let Ok(child_id) = ThreadId::parse(&child.thread_id) {
                        let _ = self.cancel(&child_id);
                    }
                }
            }
        }
        hit
    }

    /// Durable record for a thread.
    pub fn status(&self, thread_id: &ThreadId) -> Result<ThreadRecord> {
        self.registry
            .get(thread_id)?
            .ok_or_else(|| StrandError::ThreadNotFound(thread_id.to_string()).into())
    }

    /// Number of in-process active runs.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Wait for threads to reach a terminal state.
    ///
    /// Each id is resolved through its continuation chain first — waiting
    /// on an early link transparently yields the final link's record.
    /// Same-process waits block on a completion notification; cross-process
    /// waits poll the registry at the configured fixed interval.
    #[instrument(skip(self, thread_ids))]
    pub async fn wait(
        &self,
        thread_ids: &[ThreadId],
        mode: WaitMode,
        timeout: Duration,
        fail_fast: bool,
    ) -> Result<HashMap<String, ThreadRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut results: HashMap<String, ThreadRecord> = HashMap::new();
        let mut pending: Vec<ThreadId> = thread_ids.to_vec();

        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for id in pending {
                match self.try_finished(&id)? {
                    Some(record) => {
                        let errored = record.status == ThreadStatus::Error;
                        let _ = results.insert(id.to_string(), record);
                        if mode == WaitMode::Any {
                            return Ok(results);
                        }
                        if fail_fast && errored {
                            return Ok(results);
                        }
                    }
                    None => still_pending.push(id),
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                break;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RuntimeError::WaitTimeout {
                    waited_ms: timeout.as_millis() as u64,
                    pending: pending.len(),
                });
            }

            // Prefer the in-process completion notification; fall back to
            // bounded-interval polling for cross-process threads. The
            // notification wait is itself bounded so a continuation that
            // moves the chain tip is picked up promptly.
            let tip = continuation::resolve_tip(&self.registry, &pending[0])?;
            let notify = self
                .active
                .lock()
                .get(tip.as_str())
                .map(|run| Arc::clone(&run.done));
            let slice = remaining.min(Duration::from_millis(self.config.poll_interval_ms));
            match notify {
                Some(notify) => {
                    let _ = tokio::time::timeout(slice, notify.notified()).await;
                }
                None => tokio::time::sleep(slice).await,
            }
        }

        Ok(results)
    }

    /// Chain-resolved terminal record for `thread_id`, or `None` while it
    /// is still running.
    fn try_finished(&self, thread_id: &ThreadId) -> Result<Option<ThreadRecord>> {
        let tip = continuation::resolve_tip(&self.registry, thread_id)?;
        let record = self
            .registry
            .get(&tip)?
            .ok_or_else(|| StrandError::ThreadNotFound(tip.to_string()))?;
        if record.status.is_terminal() && record.status != ThreadStatus::Continued {
            return Ok(Some(record));
        }
        Ok(None)
    }
}

enum ErrorVerdict {
    Retry,
    Fail(Value),
}
