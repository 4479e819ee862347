//! Runtime configuration.

use serde::{Deserialize, Serialize};

use strand_core::limits::Limits;

/// Orchestrator configuration, merged below task declarations and
/// spawn-time overrides during limit resolution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    /// Process-wide default limit layer.
    pub default_limits: Limits,
    /// Spend ceiling for roots whose resolved limits carry none.
    pub default_root_budget: f64,
    /// Reservation for children whose resolved limits carry no spend cap.
    pub default_child_reservation: f64,
    /// Context-window fraction at which handoff triggers.
    pub handoff_threshold: f64,
    /// Assumed model context window in tokens.
    pub context_window_tokens: u64,
    /// Token ceiling for the trailing window carried into a successor.
    pub trailing_window_tokens: u64,
    /// Rough chars-per-token divisor used for window estimation.
    pub chars_per_token: u64,
    /// Cross-process wait poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Whether cancelling a parent also cancels its children.
    pub cascade_cancel: bool,
    /// Whether an overspend anomaly fails finalization instead of being
    /// logged.
    pub overspend_is_fatal: bool,
    /// On-disk store path handed to detached worker processes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_limits: Limits {
                turns: Some(50),
                depth: Some(5),
                spawns: Some(16),
                ..Default::default()
            },
            default_root_budget: 5.0,
            default_child_reservation: 0.25,
            handoff_threshold: 0.9,
            context_window_tokens: 200_000,
            trailing_window_tokens: 8_000,
            chars_per_token: 4,
            poll_interval_ms: 250,
            cascade_cancel: false,
            overspend_is_fatal: false,
            store_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.handoff_threshold, 0.9);
        assert_eq!(cfg.poll_interval_ms, 250);
        assert!(!cfg.cascade_cancel);
        assert!(!cfg.overspend_is_fatal);
        assert_eq!(cfg.default_limits.depth, Some(5));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: OrchestratorConfig =
            serde_json::from_str(r#"{"handoffThreshold": 0.8, "cascadeCancel": true}"#).unwrap();
        assert_eq!(cfg.handoff_threshold, 0.8);
        assert!(cfg.cascade_cancel);
        assert_eq!(cfg.poll_interval_ms, 250);
    }
}
