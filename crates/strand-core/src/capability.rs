//! Capability patterns, attenuation, and permission checks.
//!
//! A capability is a dot-separated pattern
//! `namespace.action.resource-type.resource-pattern` where any segment may
//! be the wildcard `*` and a trailing `**` matches all remaining segments.
//! A thread's effective set is either declared by its task definition,
//! inherited from its parent, or empty — fail closed.

use serde::{Deserialize, Serialize};

use crate::errors::StrandError;

/// Namespace prefix for all required patterns built by [`check`].
pub const CAPABILITY_NAMESPACE: &str = "strand";

/// Resource-id prefix for internal bookkeeping tools, which always pass
/// the permission check (budget ops, registry reads issued by the
/// supervisor itself).
pub const INTERNAL_RESOURCE_PREFIX: &str = "strand/internal/";

/// One segment of a capability pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Segment {
    /// Exact literal match.
    Literal(String),
    /// Matches exactly one segment.
    Any,
    /// Matches zero or more trailing segments. Only valid in last position.
    Rest,
}

/// A parsed capability pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability {
    segments: Vec<Segment>,
    raw: String,
}

impl Capability {
    /// Parse a pattern string. Empty patterns and empty segments are
    /// rejected; `**` is only allowed as the final segment.
    pub fn parse(pattern: &str) -> Result<Self, StrandError> {
        if pattern.is_empty() {
            return Err(StrandError::InvalidCapability(pattern.to_string()));
        }
        let mut segments = Vec::new();
        let parts: Vec<&str> = pattern.split('.').collect();
        for (i, part) in parts.iter().enumerate() {
            let seg = match *part {
                "" => return Err(StrandError::InvalidCapability(pattern.to_string())),
                "*" => Segment::Any,
                "**" => {
                    if i != parts.len() - 1 {
                        return Err(StrandError::InvalidCapability(pattern.to_string()));
                    }
                    Segment::Rest
                }
                lit => Segment::Literal(lit.to_string()),
            };
            segments.push(seg);
        }
        Ok(Self {
            segments,
            raw: pattern.to_string(),
        })
    }

    /// The original pattern string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Test this pattern against a fully-literal required string.
    #[must_use]
    pub fn matches(&self, required: &str) -> bool {
        let req: Vec<&str> = required.split('.').collect();
        let mut pi = 0;
        for part in req.iter().copied() {
            match self.segments.get(pi) {
                Some(Segment::Rest) => return true,
                Some(Segment::Any) => {
                    if part.is_empty() {
                        return false;
                    }
                }
                Some(Segment::Literal(lit)) => {
                    if lit.as_str() != part {
                        return false;
                    }
                }
                // Pattern shorter than requirement.
                None => return false,
            }
            pi += 1;
        }
        // Requirement consumed; pattern must be done too (or end in `**`).
        match self.segments.get(pi) {
            None => true,
            Some(Segment::Rest) => true,
            Some(_) => false,
        }
    }
}

impl TryFrom<String> for Capability {
    type Error = StrandError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.raw
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Outcome of a permission check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The action is permitted.
    Allowed,
    /// The action is not permitted; the reason names the missing
    /// capability so callers can react.
    Denied {
        /// Human-readable denial reason.
        reason: String,
    },
}

impl CheckOutcome {
    /// Whether the check passed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Derive a child's effective capability set.
///
/// Declared capabilities win verbatim (authors are trusted to have scoped
/// them at authoring time); with nothing declared the parent set is
/// inherited; with neither, the set is empty and every check fails.
#[must_use]
pub fn attenuate(parent: &[Capability], declared: &[Capability]) -> Vec<Capability> {
    if !declared.is_empty() {
        return declared.to_vec();
    }
    parent.to_vec()
}

/// Check whether an effective capability set permits an action on a
/// resource.
///
/// The required pattern is `strand.{action}.{resource_type}.{resource_id}`
/// with `/` path separators in the resource id rewritten to `.`. The first
/// matching entry wins. Internal bookkeeping resources bypass the check.
#[must_use]
pub fn check(
    effective: &[Capability],
    action: &str,
    resource_type: &str,
    resource_id: &str,
) -> CheckOutcome {
    if resource_id.starts_with(INTERNAL_RESOURCE_PREFIX) {
        return CheckOutcome::Allowed;
    }

    let required = required_pattern(action, resource_type, resource_id);
    if effective.iter().any(|cap| cap.matches(&required)) {
        return CheckOutcome::Allowed;
    }

    CheckOutcome::Denied {
        reason: format!(
            "missing capability {required} ({} granted)",
            if effective.is_empty() {
                "none".to_string()
            } else {
                effective
                    .iter()
                    .map(Capability::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        ),
    }
}

fn required_pattern(action: &str, resource_type: &str, resource_id: &str) -> String {
    let id = resource_id.replace('/', ".");
    if id.is_empty() {
        format!("{CAPABILITY_NAMESPACE}.{action}.{resource_type}")
    } else {
        format!("{CAPABILITY_NAMESPACE}.{action}.{resource_type}.{id}")
    }
}
