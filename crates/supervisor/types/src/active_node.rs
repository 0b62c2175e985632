use crate::NodeConfig;

/// The single `NodeConfig` currently driving a `ManagedPipeline`'s `HeadSource`.
///
/// Transient: never persisted, lost on supervisor restart, and recomputed from the
/// current node set on the next reconcile. See `select_active` in `ekko-supervisor-core`
/// for the selection rule ("newest enabled wins").
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveNodeSelection(NodeConfig);

impl ActiveNodeSelection {
    /// Wraps a `NodeConfig` as the active selection.
    pub fn new(config: NodeConfig) -> Self {
        Self(config)
    }

    /// Borrows the underlying configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.0
    }

    /// Consumes the selection, returning the underlying configuration.
    pub fn into_config(self) -> NodeConfig {
        self.0
    }

    /// The active node's id.
    pub fn node_id(&self) -> &str {
        &self.0.id
    }

    /// `true` if `other` is the same node id with identical `http_url`/`wss_url`.
    pub fn has_same_endpoints(&self, other: &NodeConfig) -> bool {
        self.0.id == other.id && self.0.http_url == other.http_url && self.0.wss_url == other.wss_url
    }
}
