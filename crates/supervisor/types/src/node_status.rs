use core::fmt;

use serde::{Deserialize, Serialize};

/// Advisory node-status vocabulary written back to the config bucket by the supervisor.
///
/// Only the supervisor writes these values (`PipelineSupervisor::update_node_status`);
/// the dashboard only reads them. Status is never consulted by reconciliation logic —
/// `isEnabled` and key presence are the only authoritative inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "lowercase")]
pub enum NodeStatus {
    /// Currently driving a pipeline's live upstream subscription.
    Active,
    /// Was active but has been superseded by a newer enabled node in its group.
    Stale,
    /// Reachable but degraded: publish failures, serialization failures, or a writer error.
    Unhealthy,
    /// Failed to start or reconnect; a reconcile will retry.
    Error(String),
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Stale
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Stale => f.write_str("stale"),
            Self::Unhealthy => f.write_str("unhealthy"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_tagged_shape() {
        let value = serde_json::to_value(NodeStatus::Error("boom".into())).unwrap();
        assert_eq!(value, serde_json::json!({"state": "error", "message": "boom"}));
    }

    #[test]
    fn round_trips_through_json() {
        for status in [NodeStatus::Active, NodeStatus::Stale, NodeStatus::Unhealthy] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(serde_json::from_str::<NodeStatus>(&json).unwrap(), status);
        }
    }
}
