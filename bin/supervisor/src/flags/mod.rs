//! CLI flag groups for the `ekko-supervisor` binary.

mod supervisor;
pub use supervisor::SupervisorArgs;
