use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A new-block notification, published to `<network>.<subnet>.<vmType>.newheads`.
///
/// `node_id` is the id of the active node that sourced this event. Upstreams that omit a
/// node identity in their own payload get stamped by the owning `ManagedPipeline` before
/// publish; every event that reaches the bus carries a non-empty `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewHeadEvent {
    /// Hash of the new block.
    pub block_hash: String,
    /// Height of the new block.
    pub block_number: u64,
    /// Hash of the new block's parent.
    pub parent_hash: String,
    /// Block timestamp as reported by the upstream.
    pub timestamp: DateTime<Utc>,
    /// Id of the node that sourced this event, stamped if the upstream omitted it.
    #[serde(default)]
    pub node_id: String,
}

impl NewHeadEvent {
    /// `true` once this event has been stamped with a sourcing node id.
    pub fn has_node_id(&self) -> bool {
        !self.node_id.is_empty()
    }

    /// Stamps the event with `node_id` if it does not already carry one.
    pub fn stamp_node_id(&mut self, node_id: &str) {
        if !self.has_node_id() {
            self.node_id = node_id.to_owned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(node_id: &str) -> NewHeadEvent {
        NewHeadEvent {
            block_hash: "0xabc".into(),
            block_number: 42,
            parent_hash: "0xdef".into(),
            timestamp: Utc::now(),
            node_id: node_id.into(),
        }
    }

    #[test]
    fn stamp_fills_in_missing_node_id() {
        let mut event = sample("");
        event.stamp_node_id("n1");
        assert_eq!(event.node_id, "n1");
    }

    #[test]
    fn stamp_does_not_override_existing_node_id() {
        let mut event = sample("n2");
        event.stamp_node_id("n1");
        assert_eq!(event.node_id, "n2");
    }
}
