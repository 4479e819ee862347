//! Limit resolution: four-layer merge with parent clamping.
//!
//! Limits come from process-wide defaults, the task definition, and
//! spawn-time overrides, merged key-by-key in that order. The merged
//! result is then clamped so a child can never exceed its parent; depth
//! decrements monotonically and a negative result fails the spawn before
//! any side effect occurs.

use serde::{Deserialize, Serialize};

use crate::errors::{LimitKind, StrandError};

/// A layer of limits. Every field optional — an absent key means
/// "no ceiling at this layer".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Limits {
    /// Maximum LLM turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turns: Option<u64>,
    /// Maximum total tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Maximum spend in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spend: Option<f64>,
    /// Maximum wall-clock duration in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    /// Maximum child spawns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawns: Option<u64>,
    /// Remaining nesting depth for further spawns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<i64>,
}

impl Limits {
    /// Overlay `other` onto `self` key-by-key (present keys in `other`
    /// win).
    #[must_use]
    pub fn overridden_by(&self, other: &Limits) -> Limits {
        Limits {
            turns: other.turns.or(self.turns),
            tokens: other.tokens.or(self.tokens),
            spend: other.spend.or(self.spend),
            duration_seconds: other.duration_seconds.or(self.duration_seconds),
            spawns: other.spawns.or(self.spawns),
            depth: other.depth.or(self.depth),
        }
    }

    /// Ceiling for a given kind as an f64, if set.
    #[must_use]
    pub fn ceiling(&self, kind: LimitKind) -> Option<f64> {
        match kind {
            LimitKind::Turns => self.turns.map(|v| v as f64),
            LimitKind::Tokens => self.tokens.map(|v| v as f64),
            LimitKind::Spend => self.spend,
            LimitKind::Duration => self.duration_seconds.map(|v| v as f64),
            LimitKind::Spawns => self.spawns.map(|v| v as f64),
            LimitKind::Depth => self.depth.map(|v| v as f64),
        }
    }
}

fn min_opt<T: PartialOrd + Copy>(merged: Option<T>, parent: Option<T>) -> Option<T> {
    match (merged, parent) {
        (Some(m), Some(p)) => Some(if m < p { m } else { p }),
        (Some(m), None) => Some(m),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

/// Resolve a thread's effective limits.
///
/// Merge order: `defaults` overridden by `declared` overridden by
/// `overrides`, then clamped to `parent` via per-key minimum. Depth is
/// special: `min(merged_depth, parent_depth - 1)`; a negative result is a
/// [`StrandError::DepthExhausted`] raised before the caller has performed
/// any ledger or registry mutation.
pub fn resolve(
    defaults: &Limits,
    declared: &Limits,
    overrides: &Limits,
    parent: Option<&Limits>,
) -> Result<Limits, StrandError> {
    let merged = defaults.overridden_by(declared).overridden_by(overrides);

    let Some(parent) = parent else {
        return Ok(merged);
    };

    let depth = match (merged.depth, parent.depth) {
        (_, Some(pd)) if pd <= 0 => {
            return Err(StrandError::DepthExhausted { parent_depth: pd });
        }
        (Some(md), Some(pd)) => Some(md.min(pd - 1)),
        (None, Some(pd)) => Some(pd - 1),
        (md, None) => md,
    };
    if depth.is_some_and(|d| d < 0) {
        return Err(StrandError::DepthExhausted {
            parent_depth: parent.depth.unwrap_or(0),
        });
    }

    Ok(Limits {
        turns: min_opt(merged.turns, parent.turns),
        tokens: min_opt(merged.tokens, parent.tokens),
        spend: min_opt(merged.spend, parent.spend),
        duration_seconds: min_opt(merged.duration_seconds, parent.duration_seconds),
        spawns: min_opt(merged.spawns, parent.spawns),
        depth,
    })
}
