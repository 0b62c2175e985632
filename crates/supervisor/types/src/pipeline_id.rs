use core::fmt;

use serde::{Deserialize, Serialize};

/// `lowercase(network)-lowercase(subnet)-lowercase(vmType)`.
///
/// The key under which a `ManagedPipeline` is tracked in the supervisor's
/// `PipelineId -> ManagedPipeline` map. Two `NodeConfig`s with the same
/// `PipelineId` belong to the same pipeline, regardless of the original casing
/// of their `network`/`subnet`/`vmType` fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PipelineId(String);

impl PipelineId {
    /// Derives a `PipelineId` from a grouping triple, lowercasing each component.
    pub fn new(network: &str, subnet: &str, vm_type: &str) -> Self {
        Self(format!(
            "{}-{}-{}",
            network.to_ascii_lowercase(),
            subnet.to_ascii_lowercase(),
            vm_type.to_ascii_lowercase()
        ))
    }

    /// Borrows the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
