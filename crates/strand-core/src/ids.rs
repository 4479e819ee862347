//! Branded thread identifiers.
//!
//! A [`ThreadId`] is derived from a logical task name plus a millisecond
//! timestamp disambiguator (`planner-1739012630123`). The name part is
//! sanitized so ids are safe to use as registry keys and directory names.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::StrandError;

/// Process-local tiebreaker so ids minted within the same millisecond
/// stay unique.
static MINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique thread identifier: `{name}-{millis}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Mint a new id from a logical name plus a monotonic, time-based
    /// disambiguator (millisecond timestamp with a process-local
    /// tiebreaker).
    pub fn mint(name: &str) -> Result<Self, StrandError> {
        let sanitized = sanitize_name(name)?;
        let millis = chrono::Utc::now().timestamp_millis() as u64;
        let tiebreak = MINT_COUNTER.fetch_add(1, Ordering::Relaxed) % 1000;
        Ok(Self(format!("{sanitized}-{}", millis * 1000 + tiebreak)))
    }

    /// Wrap an already-formed id (e.g. read back from the registry).
    ///
    /// The full id must be non-empty and use only `[A-Za-z0-9_-]`.
    pub fn parse(raw: &str) -> Result<Self, StrandError> {
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StrandError::InvalidThreadId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The logical name part (everything before the trailing disambiguator).
    #[must_use]
    pub fn name(&self) -> &str {
        match self.0.rfind('-') {
            Some(idx) if self.0[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &self.0[..idx],
            _ => &self.0,
        }
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ThreadId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Sanitize a logical thread name.
///
/// Trims whitespace, collapses internal whitespace runs to `_`, and drops
/// any character outside `[A-Za-z0-9_-]`. An empty result is an error
/// rather than a silently-invented name.
pub fn sanitize_name(name: &str) -> Result<String, StrandError> {
    let mut out = String::with_capacity(name.len());
    let mut in_space = false;
    for c in name.trim().chars() {
        if c.is_whitespace() {
            in_space = true;
            continue;
        }
        if in_space {
            out.push('_');
            in_space = false;
        }
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        }
    }
    if out.is_empty() {
        return Err(StrandError::InvalidThreadId(name.to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn mint_appends_disambiguator() {
        let id = ThreadId::mint("planner").unwrap();
        assert!(id.as_str().starts_with("planner-"));
        assert_eq!(id.name(), "planner");
    }

    #[test]
    fn mint_sanitizes_whitespace() {
        let id = ThreadId::mint("  fix login bug  ").unwrap();
        assert!(id.as_str().starts_with("fix_login_bug-"));
    }

    #[test]
    fn mint_drops_special_characters() {
        let id = ThreadId::mint("deploy!@#v2").unwrap();
        assert!(id.as_str().starts_with("deployv2-"));
    }

    #[test]
    fn mint_empty_name_rejected() {
        assert_matches!(ThreadId::mint("   "), Err(StrandError::InvalidThreadId(_)));
        assert_matches!(ThreadId::mint("!!!"), Err(StrandError::InvalidThreadId(_)));
    }

    #[test]
    fn parse_roundtrip() {
        let id = ThreadId::parse("worker-1739012630123").unwrap();
        assert_eq!(id.as_str(), "worker-1739012630123");
        assert_eq!(id.name(), "worker");
    }

    #[test]
    fn parse_rejects_invalid() {
        assert_matches!(ThreadId::parse(""), Err(StrandError::InvalidThreadId(_)));
        assert_matches!(
            ThreadId::parse("has space"),
            Err(StrandError::InvalidThreadId(_))
        );
        assert_matches!(
            ThreadId::parse("has/slash"),
            Err(StrandError::InvalidThreadId(_))
        );
    }

    #[test]
    fn name_without_numeric_suffix_is_whole_id() {
        let id = ThreadId::parse("no-suffix-here").unwrap();
        assert_eq!(id.name(), "no-suffix-here");
    }

    #[test]
    fn serde_is_transparent() {
        let id = ThreadId::parse("worker-123").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"worker-123\"");
        let back: ThreadId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
