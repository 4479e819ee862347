//! Layered hook engine.
//!
//! Hooks are loaded once per thread from multiple sources (builtin,
//! project, task) and merged by layer: a hook with the same id in a
//! higher-precedence layer replaces the lower one. For control events the
//! first matching hook with a control action wins, except that hooks in a
//! layer flagged always-run still execute (their emit-style actions are
//! collected) even after an earlier layer decided the outcome. For
//! context-injection events every matching hook contributes, concatenated
//! in layer order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use strand_core::condition::Condition;

/// What a hook does when it fires.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookAction {
    /// Contribute a context fragment (context-injection events only).
    InjectContext {
        /// The fragment.
        text: String,
    },
    /// Re-attempt the failed/limited unit of work.
    Retry,
    /// Stop cleanly, preserving state for later resumption.
    Suspend,
    /// Surface the event to the operator and stop.
    Escalate,
    /// Run a named sub-task in reaction to the event.
    Invoke {
        /// Task to run.
        task: String,
    },
    /// Emit a named event as a side effect; never decides the outcome.
    Emit {
        /// Event name.
        event: String,
    },
}

impl HookAction {
    /// Whether this action decides a control event's outcome.
    #[must_use]
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::InjectContext { .. } | Self::Emit { .. })
    }
}

/// A declarative hook rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookDef {
    /// Identifier; same-id hooks from higher layers replace lower ones.
    pub id: String,
    /// Triggering event name (`limit`, `error`, `thread_started`, ...).
    pub event: String,
    /// Optional guard evaluated against the event context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// What to do when the hook fires.
    pub action: HookAction,
}

/// One layered source of hooks.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookSource {
    /// Layer number: lower layers evaluate first, higher layers win
    /// same-id replacement.
    pub layer: u8,
    /// Hooks in an always-run layer still execute after an earlier layer
    /// has decided a control event.
    #[serde(default)]
    pub always_run: bool,
    /// The hooks.
    pub hooks: Vec<HookDef>,
}

/// The decision for a control event.
#[derive(Clone, Debug, PartialEq)]
pub struct HookDecision {
    /// Id of the deciding hook.
    pub hook_id: String,
    /// The winning control action.
    pub action: HookAction,
    /// Emit-style side effects collected from always-run layers.
    pub side_effects: Vec<HookAction>,
}

#[derive(Clone, Debug)]
struct MergedHook {
    layer: u8,
    always_run: bool,
    def: HookDef,
}

/// Hook engine with layers merged and sorted.
pub struct HookEngine {
    hooks: Vec<MergedHook>,
}

impl HookEngine {
    /// Merge layered sources. Same-id hooks from a higher layer replace
    /// lower ones; the result is sorted by layer (stable within a layer).
    #[must_use]
    pub fn new(sources: &[HookSource]) -> Self {
        let mut by_id: Vec<MergedHook> = Vec::new();
        let mut ordered = sources.to_vec();
        ordered.sort_by_key(|s| s.layer);
        for source in &ordered {
            for def in &source.hooks {
                let merged = MergedHook {
                    layer: source.layer,
                    always_run: source.always_run,
                    def: def.clone(),
                };
                if let Some(existing) = by_id.iter_mut().find(|h| h.def.id == def.id) {
                    debug!(
                        hook = %def.id,
                        from_layer = existing.layer,
                        to_layer = source.layer,
                        "hook overridden by higher layer"
                    );
                    *existing = merged;
                } else {
                    by_id.push(merged);
                }
            }
        }
        by_id.sort_by_key(|h| h.layer);
        Self { hooks: by_id }
    }

    /// Number of merged hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn fires(hook: &MergedHook, event: &str, ctx: &Value) -> bool {
        if hook.def.event != event {
            return false;
        }
        hook.def
            .condition
            .as_ref()
            .is_none_or(|c| c.evaluate(ctx))
    }

    /// Decide a control event.
    ///
    /// First matching hook (by layer order) with a control action wins.
    /// Always-run layers are evaluated regardless; their `Emit` actions
    /// are collected as side effects, and a control action from an
    /// always-run layer only decides if nothing earlier did.
    #[must_use]
    pub fn decide(&self, event: &str, ctx: &Value) -> Option<HookDecision> {
        let mut decision: Option<(String, HookAction)> = None;
        let mut side_effects = Vec::new();

        for hook in &self.hooks {
            if !Self::fires(hook, event, ctx) {
                continue;
            }
            if decision.is_some() && !hook.always_run {
                continue;
            }
            match &hook.def.action {
                HookAction::Emit { .. } => side_effects.push(hook.def.action.clone()),
                HookAction::InjectContext { .. } => {
                    warn!(hook = %hook.def.id, event, "inject_context hook on control event ignored");
                }
                action if decision.is_none() => {
                    debug!(hook = %hook.def.id, event, "hook decided control event");
                    decision = Some((hook.def.id.clone(), action.clone()));
                }
                _ => {}
            }
        }

        decision.map(|(hook_id, action)| HookDecision {
            hook_id,
            action,
            side_effects,
        })
    }

    /// Build injected context for a context event: every matching hook's
    /// fragment, concatenated in layer order.
    #[must_use]
    pub fn inject(&self, event: &str, ctx: &Value) -> Option<String> {
        let fragments: Vec<&str> = self
            .hooks
            .iter()
            .filter(|h| Self::fires(h, event, ctx))
            .filter_map(|h| match &h.def.action {
                HookAction::InjectContext { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if fragments.is_empty() {
            None
        } else {
            Some(fragments.join("\n\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_core::condition::CmpOp;

    fn hook(id: &str, event: &str, action: HookAction) -> HookDef {
        HookDef {
            id: id.into(),
            event: event.into(),
            condition: None,
            action,
        }
    }

    fn guarded(id: &str, event: &str, condition: Condition, action: HookAction) -> HookDef {
        HookDef {
            id: id.into(),
            event: event.into(),
            condition: Some(condition),
            action,
        }
    }

    // --- Merging ---

    #[test]
    fn higher_layer_replaces_same_id() {
        let engine = HookEngine::new(&[
            HookSource {
                layer: 0,
                always_run: false,
                hooks: vec![hook("on-limit", "limit", HookAction::Escalate)],
            },
            HookSource {
                layer: 10,
                always_run: false,
                hooks: vec![hook("on-limit", "limit", HookAction::Retry)],
            },
        ]);
        assert_eq!(engine.len(), 1);
        let decision = engine.decide("limit", &json!({})).unwrap();
        assert_eq!(decision.action, HookAction::Retry);
    }

    #[test]
    fn distinct_ids_both_kept() {
        let engine = HookEngine::new(&[
            HookSource {
                layer: 0,
                always_run: false,
                hooks: vec![hook("a", "limit", HookAction::Retry)],
            },
            HookSource {
                layer: 1,
                always_run: false,
                hooks: vec![hook("b", "limit", HookAction::Escalate)],
            },
        ]);
        assert_eq!(engine.len(), 2);
    }

    // --- Control decisions ---

    #[test]
    fn first_matching_layer_wins() {
        let engine = HookEngine::new(&[
            HookSource {
                layer: 1,
                always_run: false,
                hooks: vec![hook("late", "limit", HookAction::Escalate)],
            },
            HookSource {
                layer: 0,
                always_run: false,
                hooks: vec![hook("early", "limit", HookAction::Retry)],
            },
        ]);
        let decision = engine.decide("limit", &json!({})).unwrap();
        assert_eq!(decision.hook_id, "early");
        assert_eq!(decision.action, HookAction::Retry);
    }

    #[test]
    fn condition_gates_firing() {
        let engine = HookEngine::new(&[HookSource {
            layer: 0,
            always_run: false,
            hooks: vec![guarded(
                "turns-only",
                "limit",
                Condition::cmp("event.code", CmpOp::Eq, json!("turns_exceeded")),
                HookAction::Retry,
            )],
        }]);
        assert!(
            engine
                .decide("limit", &json!({"event": {"code": "turns_exceeded"}}))
                .is_some()
        );
        assert!(
            engine
                .decide("limit", &json!({"event": {"code": "spend_exceeded"}}))
                .is_none()
        );
    }

    #[test]
    fn no_matching_hook_returns_none() {
        let engine = HookEngine::new(&[HookSource {
            layer: 0,
            always_run: false,
            hooks: vec![hook("on-error", "error", HookAction::Retry)],
        }]);
        assert!(engine.decide("limit", &json!({})).is_none());
    }

    #[test]
    fn always_run_layer_collects_side_effects_after_decision() {
        let engine = HookEngine::new(&[
            HookSource {
                layer: 0,
                always_run: false,
                hooks: vec![hook("decide", "limit", HookAction::Suspend)],
            },
            HookSource {
                layer: 99,
                always_run: true,
                hooks: vec![hook(
                    "audit",
                    "limit",
                    HookAction::Emit {
                        event: "limit_audit".into(),
                    },
                )],
            },
        ]);
        let decision = engine.decide("limit", &json!({})).unwrap();
        assert_eq!(decision.action, HookAction::Suspend);
        assert_eq!(
            decision.side_effects,
            vec![HookAction::Emit {
                event: "limit_audit".into()
            }]
        );
    }

    #[test]
    fn always_run_control_action_decides_only_as_fallback() {
        let engine = HookEngine::new(&[
            HookSource {
                layer: 0,
                always_run: false,
                hooks: vec![hook("primary", "error", HookAction::Retry)],
            },
            HookSource {
                layer: 99,
                always_run: true,
                hooks: vec![hook("fallback", "error", HookAction::Escalate)],
            },
        ]);
        // Primary matched, fallback's control action does not override.
        let decision = engine.decide("error", &json!({})).unwrap();
        assert_eq!(decision.hook_id, "primary");
        assert_eq!(decision.action, HookAction::Retry);

        // Without the primary, the always-run layer decides.
        let engine = HookEngine::new(&[HookSource {
            layer: 99,
            always_run: true,
            hooks: vec![hook("fallback", "error", HookAction::Escalate)],
        }]);
        let decision = engine.decide("error", &json!({})).unwrap();
        assert_eq!(decision.hook_id, "fallback");
    }

    #[test]
    fn non_always_layers_short_circuit() {
        let engine = HookEngine::new(&[
            HookSource {
                layer: 0,
                always_run: false,
                hooks: vec![hook("first", "error", HookAction::Retry)],
            },
            HookSource {
                layer: 1,
                always_run: false,
                hooks: vec![hook(
                    "second",
                    "error",
                    HookAction::Emit {
                        event: "never".into(),
                    },
                )],
            },
        ]);
        let decision = engine.decide("error", &json!({})).unwrap();
        assert!(decision.side_effects.is_empty());
    }

    // --- Context injection ---

    #[test]
    fn inject_concatenates_in_layer_order() {
        let engine = HookEngine::new(&[
            HookSource {
                layer: 5,
                always_run: false,
                hooks: vec![hook(
                    "rules",
                    "thread_started",
                    HookAction::InjectContext {
                        text: "Project rules".into(),
                    },
                )],
            },
            HookSource {
                layer: 0,
                always_run: false,
                hooks: vec![hook(
                    "identity",
                    "thread_started",
                    HookAction::InjectContext {
                        text: "You are a worker".into(),
                    },
                )],
            },
        ]);
        let ctx = engine.inject("thread_started", &json!({})).unwrap();
        assert_eq!(ctx, "You are a worker\n\nProject rules");
    }

    #[test]
    fn inject_skips_non_matching_and_control_hooks() {
        let engine = HookEngine::new(&[HookSource {
            layer: 0,
            always_run: false,
            hooks: vec![
                hook("noise", "thread_started", HookAction::Retry),
                guarded(
                    "gated",
                    "thread_started",
                    Condition::cmp("task", CmpOp::Eq, json!("other")),
                    HookAction::InjectContext {
                        text: "hidden".into(),
                    },
                ),
            ],
        }]);
        assert!(engine.inject("thread_started", &json!({"task": "mine"})).is_none());
    }

    #[test]
    fn serde_roundtrip() {
        let source = HookSource {
            layer: 2,
            always_run: true,
            hooks: vec![guarded(
                "h",
                "limit",
                Condition::cmp("event.code", CmpOp::Eq, json!("spend_exceeded")),
                HookAction::Invoke {
                    task: "notify-operator".into(),
                },
            )],
        };
        let json = serde_json::to_string(&source).unwrap();
        let back: HookSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hooks, source.hooks);
        assert!(back.always_run);
    }
}
