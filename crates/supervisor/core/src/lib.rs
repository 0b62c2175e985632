//! Reconciliation core of the ekko-supervisor control plane.
//!
//! This crate is the two-tier dynamic reconciler described by the control plane: a
//! [`supervisor::PipelineSupervisor`] watching the config bucket and converging a set of
//! [`pipeline::ManagedPipeline`]s, paired with a [`fetcher::FetcherSupervisor`] converging
//! one [`fetcher::BlockFetcher`] per enabled node. Everything else in this crate —
//! [`kv`], [`bus`], [`headsource`], [`writer`] — is the narrow collaborator surface those
//! two reconcilers are built from.

pub mod bus;
pub mod error;
pub mod fetcher;
pub mod headsource;
pub mod kv;
pub mod pipeline;
pub mod supervisor;
pub mod writer;

pub use bus::{MessageBus, NatsMessageBus, ReconcileTrigger};
pub use error::{BusError, FetcherError, HeadSourceError, KvError, PipelineError, SupervisorError, WriterError};
pub use fetcher::{
    AllowAllAddresses, AlloyBlockRpcClient, ArrowWriterConfigFactory, BlockFetcher, BlockFetcherFactory,
    BlockRpcClient, Decoder, FetchedBlock, FetchedTransaction, FetcherSupervisor, HeadSubscriber,
    NatsHeadSubscriber, NoopDecoder, WatchedAddresses,
};
pub use headsource::{HeadSource, ScriptedHeadSource, WsHeadSource};
pub use kv::{ConfigBucket, DataBucket, NatsKvBucket, WatchEvent};
pub use pipeline::{HeadSourceFactory, ManagedPipeline, PipelineState, StatusReporter};
pub use supervisor::{NewManagedPipelineFunc, PipelineSupervisor};
pub use writer::{ArrowWriter, WriterConfig};
