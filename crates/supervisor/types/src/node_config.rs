use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{NodeStatus, PipelineId, VmType};

/// Operator-owned node configuration, persisted in the config bucket under
/// key `nodestore.<id>`.
///
/// `(network, subnet, vmType)` is the grouping triple: every field here besides `status`
/// is operator-controlled and read verbatim from the bucket. `status` is the one field
/// the supervisor itself writes back (see [`NodeStatus`]); changing it never affects
/// reconciliation, which depends only on `is_enabled` and key presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable opaque identifier, unique across the bucket.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Display description.
    #[serde(default)]
    pub description: String,
    /// Chain family, e.g. `"ethereum"`.
    pub network: String,
    /// Chain subnet, e.g. `"mainnet"`.
    pub subnet: String,
    /// Execution-environment family.
    pub vm_type: VmType,
    /// HTTP RPC endpoint.
    pub http_url: String,
    /// WebSocket subscription endpoint.
    pub wss_url: String,
    /// Whether this node is scheduled for ingestion at all.
    pub is_enabled: bool,
    /// Last-known runtime status; advisory, mutated only by the supervisor.
    #[serde(default)]
    pub status: NodeStatus,
    /// Record creation time, set once by the config-bucket writer.
    pub created_at: DateTime<Utc>,
    /// Last modification time; overwritten on every status change.
    pub updated_at: DateTime<Utc>,
}

impl NodeConfig {
    /// The key format used in the config bucket: `nodestore.<id>`.
    pub fn bucket_key(&self) -> String {
        format!("nodestore.{}", self.id)
    }

    /// Derives this node's [`PipelineId`] from its grouping triple.
    pub fn pipeline_id(&self) -> PipelineId {
        PipelineId::new(&self.network, &self.subnet, self.vm_type.as_str())
    }

    /// Parses a `nodestore.<id>` value from the raw bytes stored in the config bucket.
    ///
    /// Malformed records are the caller's responsibility to log and skip; this only
    /// distinguishes parse failure from success.
    pub fn from_bucket_value(bytes: &[u8]) -> Result<Self, NodeConfigParseError> {
        serde_json::from_slice(bytes).map_err(NodeConfigParseError)
    }

    /// Serializes this record back into the JSON form the config bucket stores.
    pub fn to_bucket_value(&self) -> Result<Vec<u8>, NodeConfigParseError> {
        serde_json::to_vec(self).map_err(NodeConfigParseError)
    }

    /// Returns a copy with `status` and `updated_at` overwritten; `created_at` is never
    /// touched by the supervisor.
    pub fn with_status(&self, status: NodeStatus, now: DateTime<Utc>) -> Self {
        Self { status, updated_at: now, ..self.clone() }
    }
}

/// A `NodeConfig` value in the bucket did not parse as valid JSON against this schema.
#[derive(Debug, Error)]
#[error("failed to parse NodeConfig: {0}")]
pub struct NodeConfigParseError(#[from] serde_json::Error);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeConfig {
        NodeConfig {
            id: "n1".into(),
            name: "Primary".into(),
            description: String::new(),
            network: "Ethereum".into(),
            subnet: "Mainnet".into(),
            vm_type: VmType::Evm,
            http_url: "http://localhost:8545".into(),
            wss_url: "ws://localhost:8546".into(),
            is_enabled: true,
            status: NodeStatus::default(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    #[test]
    fn pipeline_id_lowercases_triple() {
        assert_eq!(sample().pipeline_id().as_str(), "ethereum-mainnet-evm");
    }

    #[test]
    fn bucket_key_uses_nodestore_prefix() {
        assert_eq!(sample().bucket_key(), "nodestore.n1");
    }

    #[test]
    fn round_trips_through_bucket_json() {
        let config = sample();
        let bytes = config.to_bucket_value().unwrap();
        assert_eq!(NodeConfig::from_bucket_value(&bytes).unwrap(), config);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(NodeConfig::from_bucket_value(b"{not json").is_err());
    }

    #[test]
    fn with_status_only_touches_status_and_updated_at() {
        let original = sample();
        let now = Utc::now();
        let updated = original.with_status(NodeStatus::Unhealthy, now);
        assert_eq!(updated.status, NodeStatus::Unhealthy);
        assert_eq!(updated.updated_at, now);
        assert_eq!(updated.created_at, original.created_at);
        assert_eq!(updated.id, original.id);
    }
}
