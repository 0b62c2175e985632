//! Shared data types for the ekko-supervisor control plane.
//!
//! These types cross the boundaries the control plane actually has: the JSON payloads
//! stored in the config key-value bucket, the events published to the message bus, and
//! the records handed from a block fetcher to its columnar writer. Nothing here owns
//! behavior beyond small, pure helpers (pipeline-id derivation, active-node selection) —
//! the reconciliation logic that consumes these types lives in `ekko-supervisor-core`.

mod active_node;
mod head_event;
mod node_config;
mod node_status;
mod pipeline_id;
mod transaction_record;
mod vm_type;

pub use active_node::ActiveNodeSelection;
pub use head_event::NewHeadEvent;
pub use node_config::{NodeConfig, NodeConfigParseError};
pub use node_status::NodeStatus;
pub use pipeline_id::PipelineId;
pub use transaction_record::{DecodedCall, TransactionRecord};
pub use vm_type::VmType;
