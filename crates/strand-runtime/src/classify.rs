//! Error classification.
//!
//! Execution errors are matched against ordered condition rules to pick a
//! category and retry policy. Anything unmatched is permanent and
//! surfaces immediately.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use strand_core::condition::Condition;
use strand_core::retry::RetryConfig;

/// One classification rule, evaluated in order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationRule {
    /// Category name (`rate_limit`, `network`, `provider_overloaded`, ...).
    pub category: String,
    /// Condition over the error context document.
    pub condition: Condition,
    /// Whether errors in this category may be retried.
    pub retryable: bool,
    /// Backoff policy for retryable categories.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Classification result.
#[derive(Clone, Debug, PartialEq)]
pub struct Classification {
    /// Matched category, or `permanent` for unmatched errors.
    pub category: String,
    /// Whether to retry.
    pub retryable: bool,
    /// Backoff policy.
    pub retry: RetryConfig,
}

/// Ordered rule set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl ErrorClassifier {
    /// Build from ordered rules — first match wins.
    #[must_use]
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// A reasonable built-in rule set: HTTP 429/5xx and socket timeouts
    /// retry with backoff; everything else is permanent.
    #[must_use]
    pub fn builtin() -> Self {
        use serde_json::json;
        use strand_core::condition::CmpOp;
        Self::new(vec![
            ClassificationRule {
                category: "rate_limit".into(),
                condition: Condition::Any(vec![
                    Condition::cmp("error.status", CmpOp::Eq, json!(429)),
                    Condition::cmp("error.type", CmpOp::Matches, json!("(?i)rate.?limit")),
                ]),
                retryable: true,
                retry: RetryConfig {
                    max_attempts: 5,
                    base_delay_ms: 2_000,
                    multiplier: 2.0,
                    max_delay_ms: 60_000,
                },
            },
            ClassificationRule {
                category: "provider_overloaded".into(),
                condition: Condition::Any(vec![
                    Condition::cmp("error.status", CmpOp::Gte, json!(500)),
                    Condition::cmp("error.type", CmpOp::Matches, json!("(?i)overloaded")),
                ]),
                retryable: true,
                retry: RetryConfig::default(),
            },
            ClassificationRule {
                category: "network".into(),
                condition: Condition::cmp(
                    "error.message",
                    CmpOp::Matches,
                    json!("(?i)(timed? ?out|connection (reset|refused))"),
                ),
                retryable: true,
                retry: RetryConfig::default(),
            },
        ])
    }

    /// Classify an error context document.
    #[must_use]
    pub fn classify(&self, ctx: &Value) -> Classification {
        for rule in &self.rules {
            if rule.condition.evaluate(ctx) {
                debug!(category = %rule.category, "error classified");
                return Classification {
                    category: rule.category.clone(),
                    retryable: rule.retryable,
                    retry: rule.retry,
                };
            }
        }
        Classification {
            category: "permanent".into(),
            retryable: false,
            retry: RetryConfig::default(),
        }
    }
}
