//! Process-level orchestration for the ekko-supervisor control plane.
//!
//! Wires the reconciliation primitives in `ekko-supervisor-core` to their production
//! collaborators — a NATS message bus and JetStream key-value buckets, an S3-compatible
//! object store — and runs the resulting `PipelineSupervisor` as a [`SupervisorActor`]
//! until the process is asked to shut down.

pub mod actors;
mod service;

pub use actors::SupervisorActor;
pub use service::{Service, ServiceConfig};
