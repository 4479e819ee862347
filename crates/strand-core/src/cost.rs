//! Cost accumulation and limit-breach detection.
//!
//! A [`CostTracker`] accumulates turns, tokens, spawns, and spend as the
//! execution loop reports usage, and compares the running totals against a
//! thread's resolved [`Limits`].

use serde::{Deserialize, Serialize};

use crate::errors::LimitKind;
use crate::limits::Limits;

/// Token/spend usage reported for a single turn by the execution delegate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnUsage {
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// Spend for the turn in USD (pricing applied upstream).
    pub spend: f64,
}

impl TurnUsage {
    /// Total tokens for the turn.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A detected limit breach.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LimitBreach {
    /// Which limit was breached.
    pub kind: LimitKind,
    /// Observed value.
    pub current: f64,
    /// Resolved ceiling.
    pub max: f64,
}

/// Accumulated cost for one thread.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTracker {
    /// LLM turns taken.
    pub turns: u64,
    /// Total tokens (input + output).
    pub tokens: u64,
    /// Input tokens.
    pub input_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
    /// Child threads spawned.
    pub spawns: u64,
    /// Spend in USD.
    pub spend: f64,
    /// Wall-clock seconds elapsed. Updated by the execution loop; carried
    /// here so a restored tracker keeps the predecessor's elapsed time.
    pub elapsed_seconds: f64,
}

impl CostTracker {
    /// Charge one turn of usage.
    pub fn charge_turn(&mut self, usage: &TurnUsage) {
        self.turns += 1;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.tokens += usage.total_tokens();
        self.spend += usage.spend;
    }

    /// Record a child spawn.
    pub fn charge_spawn(&mut self) {
        self.spawns += 1;
    }

    /// First breached limit, in a fixed check order (turns, tokens,
    /// spawns, duration, spend), or `None`.
    #[must_use]
    pub fn breach(&self, limits: &Limits) -> Option<LimitBreach> {
        let checks = [
            (LimitKind::Turns, self.turns as f64),
            (LimitKind::Tokens, self.tokens as f64),
            (LimitKind::Spawns, self.spawns as f64),
            (LimitKind::Duration, self.elapsed_seconds),
            (LimitKind::Spend, self.spend),
        ];
        for (kind, current) in checks {
            if let Some(max) = limits.ceiling(kind) {
                if current >= max {
                    return Some(LimitBreach { kind, current, max });
                }
            }
        }
        None
    }

    /// JSON form for hook contexts and persisted records.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_turn_accumulates() {
        let mut cost = CostTracker::default();
        cost.charge_turn(&TurnUsage {
            input_tokens: 100,
            output_tokens: 50,
            spend: 0.01,
        });
        cost.charge_turn(&TurnUsage {
            input_tokens: 200,
            output_tokens: 100,
            spend: 0.02,
        });
        assert_eq!(cost.turns, 2);
        assert_eq!(cost.input_tokens, 300);
        assert_eq!(cost.output_tokens, 150);
        assert_eq!(cost.tokens, 450);
        assert!((cost.spend - 0.03).abs() < 1e-9);
    }

    #[test]
    fn no_breach_under_limits() {
        let mut cost = CostTracker::default();
        cost.charge_turn(&TurnUsage::default());
        let limits = Limits {
            turns: Some(5),
            ..Default::default()
        };
        assert_eq!(cost.breach(&limits), None);
    }

    #[test]
    fn turns_breach_at_ceiling() {
        let mut cost = CostTracker::default();
        for _ in 0..5 {
            cost.charge_turn(&TurnUsage::default());
        }
        let limits = Limits {
            turns: Some(5),
            ..Default::default()
        };
        let breach = cost.breach(&limits).unwrap();
        assert_eq!(breach.kind, LimitKind::Turns);
        assert_eq!(breach.current, 5.0);
        assert_eq!(breach.max, 5.0);
    }

    #[test]
    fn spend_breach_reports_values() {
        let mut cost = CostTracker::default();
        cost.charge_turn(&TurnUsage {
            input_tokens: 0,
            output_tokens: 0,
            spend: 1.5,
        });
        let limits = Limits {
            spend: Some(1.0),
            ..Default::default()
        };
        let breach = cost.breach(&limits).unwrap();
        assert_eq!(breach.kind, LimitKind::Spend);
        assert_eq!(breach.current, 1.5);
        assert_eq!(breach.max, 1.0);
    }

    #[test]
    fn spawn_breach() {
        let mut cost = CostTracker::default();
        cost.charge_spawn();
        cost.charge_spawn();
        let limits = Limits {
            spawns: Some(2),
            ..Default::default()
        };
        assert_eq!(cost.breach(&limits).unwrap().kind, LimitKind::Spawns);
    }

    #[test]
    fn turn_order_precedence() {
        // With multiple breaches, turns wins (fixed check order).
        let mut cost = CostTracker::default();
        for _ in 0..10 {
            cost.charge_turn(&TurnUsage {
                input_tokens: 1000,
                output_tokens: 1000,
                spend: 1.0,
            });
        }
        let limits = Limits {
            turns: Some(1),
            tokens: Some(1),
            spend: Some(0.1),
            ..Default::default()
        };
        assert_eq!(cost.breach(&limits).unwrap().kind, LimitKind::Turns);
    }

    #[test]
    fn unlimited_when_no_ceilings() {
        let mut cost = CostTracker::default();
        for _ in 0..1000 {
            cost.charge_turn(&TurnUsage {
                input_tokens: 1_000,
                output_tokens: 1_000,
                spend: 10.0,
            });
        }
        assert_eq!(cost.breach(&Limits::default()), None);
    }

    #[test]
    fn serde_roundtrip() {
        let mut cost = CostTracker::default();
        cost.charge_turn(&TurnUsage {
            input_tokens: 10,
            output_tokens: 20,
            spend: 0.5,
        });
        let json = serde_json::to_string(&cost).unwrap();
        assert!(json.contains("inputTokens"));
        let back: CostTracker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cost);
    }
}
