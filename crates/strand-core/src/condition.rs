//! Boolean condition trees evaluated against a JSON context document.
//!
//! Used by the hook engine and the error classifier. Evaluation is pure
//! and total: a missing path, a type mismatch, or an invalid regex makes
//! the enclosing comparison false rather than erroring.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator for a leaf condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than (numeric).
    Gt,
    /// Greater than or equal (numeric).
    Gte,
    /// Less than (numeric).
    Lt,
    /// Less than or equal (numeric).
    Lte,
    /// Left value is a member of the right-hand array.
    In,
    /// Left string contains the right-hand substring.
    Contains,
    /// Left string matches the right-hand regex.
    Matches,
    /// The path exists (right-hand value ignored).
    Exists,
}

/// A condition tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Every child must match. An empty list matches.
    All(Vec<Condition>),
    /// At least one child must match. An empty list does not match.
    Any(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
    /// Leaf comparison against a dotted path into the context document.
    Cmp {
        /// Dotted path, e.g. `event.code` or `cost.turns`.
        path: String,
        /// Operator.
        op: CmpOp,
        /// Right-hand value.
        value: Value,
    },
}

impl Condition {
    /// Convenience constructor for a leaf comparison.
    #[must_use]
    pub fn cmp(path: &str, op: CmpOp, value: Value) -> Self {
        Self::Cmp {
            path: path.to_string(),
            op,
            value,
        }
    }

    /// Evaluate against a context document.
    #[must_use]
    pub fn evaluate(&self, ctx: &Value) -> bool {
        match self {
            Self::All(children) => children.iter().all(|c| c.evaluate(ctx)),
            Self::Any(children) => children.iter().any(|c| c.evaluate(ctx)),
            Self::Not(inner) => !inner.evaluate(ctx),
            Self::Cmp { path, op, value } => eval_cmp(resolve_path(ctx, path), *op, value),
        }
    }
}

/// Walk a dotted path through objects. Returns `None` for any missing
/// step or non-object intermediate.
fn resolve_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = ctx;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn eval_cmp(left: Option<&Value>, op: CmpOp, right: &Value) -> bool {
    if op == CmpOp::Exists {
        return left.is_some();
    }
    let Some(left) = left else {
        // Missing path: only Ne against a concrete value holds.
        return op == CmpOp::Ne && !right.is_null();
    };
    match op {
        CmpOp::Eq => left == right,
        CmpOp::Ne => left != right,
        CmpOp::Gt | CmpOp::Gte | CmpOp::Lt | CmpOp::Lte => {
            let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
                return false;
            };
            match op {
                CmpOp::Gt => l > r,
                CmpOp::Gte => l >= r,
                CmpOp::Lt => l < r,
                CmpOp::Lte => l <= r,
                _ => unreachable!(),
            }
        }
        CmpOp::In => right.as_array().is_some_and(|arr| arr.contains(left)),
        CmpOp::Contains => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => l.contains(r),
            _ => false,
        },
        CmpOp::Matches => match (left.as_str(), right.as_str()) {
            (Some(l), Some(r)) => match regex::Regex::new(r) {
                Ok(re) => re.is_match(l),
                Err(err) => {
                    tracing::warn!(pattern = r, %err, "invalid condition regex");
                    false
                }
            },
            _ => false,
        },
        CmpOp::Exists => unreachable!(),
    }
}
