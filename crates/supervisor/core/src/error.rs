//! Error kinds for the ekko-supervisor control plane, following the policy table in
//! the system design: most variants are logged and absorbed by the reconciler that
//! produced them rather than propagated, so these types exist mainly at component
//! boundaries (client/bucket/bus) where a caller genuinely needs to branch on them.

use thiserror::Error;

/// Errors from the config or data key-value bucket.
#[derive(Debug, Error)]
pub enum KvError {
    /// The bucket connection could not be opened or has dropped.
    #[error("bucket unavailable: {0}")]
    Unavailable(String),
    /// A get/put/delete against the bucket failed.
    #[error("bucket operation failed: {0}")]
    Operation(String),
    /// A watch subscription on the bucket failed to establish or was dropped.
    #[error("bucket watch failed: {0}")]
    Watch(String),
}

/// Errors from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus connection could not be opened.
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// A publish failed.
    #[error("publish failed: {0}")]
    Publish(String),
    /// A subscribe failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Errors surfaced by a [`HeadSource`](crate::headsource::HeadSource).
#[derive(Debug, Error)]
pub enum HeadSourceError {
    /// The upstream connection handshake failed or timed out.
    #[error("source start failed: {0}")]
    Start(String),
    /// The upstream closed its event channel unexpectedly.
    #[error("source dropped")]
    Dropped,
}

/// Errors surfaced by a `ManagedPipeline`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No node in the group is enabled; the pipeline has nothing to drive.
    #[error("no enabled node available")]
    NoActiveNode,
    /// Failed to (re)start the active `HeadSource`.
    #[error(transparent)]
    Source(#[from] HeadSourceError),
    /// The head event channel closed unexpectedly; the supervisor should rebuild this
    /// pipeline on the next reconcile.
    #[error("head source channel closed unexpectedly")]
    ChannelClosed,
}

/// Errors surfaced by a `BlockFetcher`.
#[derive(Debug, Error)]
pub enum FetcherError {
    /// An RPC call to the node failed, after exhausting retries.
    #[error("rpc call failed: {0}")]
    Rpc(String),
    /// The cursor key-value bucket rejected a read or write.
    #[error(transparent)]
    Kv(#[from] KvError),
    /// The head subject subscription failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors surfaced by an `ArrowWriter`.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Encoding a batch of records into columnar form failed.
    #[error("batch encoding failed: {0}")]
    Encode(String),
    /// The object-store upload failed, after exhausting retries; the batch is retained
    /// and retried on the next flush trigger, or dropped with a loud log after N failures.
    #[error("object store upload failed: {0}")]
    Upload(String),
    /// Publishing the post-flush manifest event failed.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Top-level supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The message bus or config bucket could not be opened at startup.
    #[error("bus or config bucket unavailable: {0}")]
    BusUnavailable(#[from] KvError),
    /// A client used to resolve decoded calls / watched addresses failed.
    #[error("client error: {0}")]
    Client(String),
}
