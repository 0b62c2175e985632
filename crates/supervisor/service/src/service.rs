//! Contains the main Supervisor service runner.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use ekko_supervisor_core::{
    error::SupervisorError, AllowAllAddresses, AlloyBlockRpcClient, ArrowWriter, BlockFetcher,
    BlockFetcherFactory, BlockRpcClient, ConfigBucket, DataBucket, Decoder, FetcherSupervisor,
    HeadSource, HeadSourceFactory, HeadSubscriber, MessageBus, NatsHeadSubscriber, NatsKvBucket,
    NatsMessageBus, NoopDecoder, PipelineSupervisor, StatusReporter, WatchedAddresses, WriterConfig,
    WsHeadSource,
};
use ekko_supervisor_types::{NodeConfig, NodeStatus};
use object_store::{aws::AmazonS3Builder, ObjectStore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::actors::{PipelineSupervisorActor, SupervisorActor};

/// Process-wide configuration for the supervisor service, gathered from the recognized
/// environment variables (§6) by the binary's CLI layer.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Message bus connection URL. Not named by the distilled spec, but required ambient
    /// plumbing to connect to the bus at all (§6).
    pub nats_url: String,
    /// Configuration key-value bucket name. Defaults to `ekko_nodes` (§6).
    pub config_bucket_name: String,
    /// Data key-value bucket name, shared across every `BlockFetcher`'s cursor state (§6).
    pub data_bucket_name: String,
    /// When `false`, `BlockFetcher`s forward every transaction rather than filtering
    /// against a watched-address set (§6, `FILTER_WALLETS`).
    pub filter_wallets_enabled: bool,
    /// S3-compatible object store endpoint (`MINIO_ENDPOINT`).
    pub minio_endpoint: String,
    /// S3-compatible object store access key (`MINIO_ACCESS_KEY`).
    pub minio_access_key: String,
    /// S3-compatible object store secret key (`MINIO_SECRET_KEY`).
    pub minio_secret_key: String,
    /// S3-compatible object store bucket (`MINIO_BUCKET`).
    pub minio_bucket: String,
    /// Whether to use TLS against the object store endpoint (`MINIO_USE_SSL`).
    pub minio_use_ssl: bool,
    /// Prefix under the object store bucket, before the per-group/per-node path (§4.7).
    pub object_store_base_path: String,
    /// Maximum records per `ArrowWriter` flush. Defaults to [`WriterConfig::DEFAULT_BATCH_SIZE`].
    pub batch_size: usize,
    /// Maximum wall time between `ArrowWriter` flushes. Defaults to
    /// [`WriterConfig::DEFAULT_FLUSH_INTERVAL`].
    pub flush_interval: std::time::Duration,
}

/// Builds a [`StatusReporter`] that writes status updates straight back to the config
/// bucket by `nodeID`, independent of any supervisor-held cache. Shared by the pipeline
/// supervisor's and every `BlockFetcher`'s status reporting, since both only ever publish
/// — never read back their own write (§1, one-way status callback).
fn status_reporter_for(config_bucket: Arc<dyn ConfigBucket>) -> StatusReporter {
    Arc::new(move |node_id: &str, status: NodeStatus| {
        let config_bucket = config_bucket.clone();
        let node_id = node_id.to_owned();
        tokio::spawn(async move {
            let key = format!("nodestore.{node_id}");
            let existing = match config_bucket.get(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return,
                Err(err) => {
                    error!(target: "ekko_supervisor::service", node_id, %err, "failed to read node record for status update");
                    return;
                }
            };
            let node = match NodeConfig::from_bucket_value(&existing) {
                Ok(node) => node,
                Err(err) => {
                    warn!(target: "ekko_supervisor::service", node_id, %err, "skipping status update for malformed node record");
                    return;
                }
            };
            let updated = node.with_status(status, Utc::now());
            let bytes = match updated.to_bucket_value() {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(target: "ekko_supervisor::service", node_id, %err, "failed to serialize node status update");
                    return;
                }
            };
            if let Err(err) = config_bucket.put(&key, bytes).await {
                error!(target: "ekko_supervisor::service", node_id, %err, "failed to write node status update");
            }
        });
    })
}

/// Builds the production [`BlockFetcherFactory`]: every closure invocation wires a fresh
/// `AlloyBlockRpcClient`, `NatsHeadSubscriber`, and exclusively-owned `ArrowWriter` (§3) for
/// one node, spawning the writer's flush loop as a sibling task of the fetcher it serves.
fn build_block_fetcher_factory(
    config: Arc<ServiceConfig>,
    config_bucket: Arc<dyn ConfigBucket>,
    data_bucket: Arc<dyn DataBucket>,
    store: Arc<dyn ObjectStore>,
    bus: Arc<NatsMessageBus>,
    cancel_root: CancellationToken,
) -> BlockFetcherFactory {
    Arc::new(move |node: &NodeConfig| {
        let subscriber: Arc<dyn HeadSubscriber> = Arc::new(NatsHeadSubscriber::new(bus.client().clone()));
        let rpc: Arc<dyn BlockRpcClient> = Arc::new(AlloyBlockRpcClient::new(node.http_url.clone()));
        let decoder: Arc<dyn Decoder> = Arc::new(NoopDecoder);
        let watched: Arc<dyn WatchedAddresses> = Arc::new(AllowAllAddresses);

        let writer_config = WriterConfig {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            base_path: config.object_store_base_path.clone(),
            subject: None,
            network: node.network.clone(),
            subnet: node.subnet.clone(),
            vm_type: node.vm_type.as_str().to_owned(),
            node_id: node.id.clone(),
        };
        let bus_dyn: Arc<dyn MessageBus> = bus.clone();
        let writer = Arc::new(ArrowWriter::new(writer_config, store.clone(), bus_dyn));

        let writer_cancel = cancel_root.child_token();
        let writer_task = writer.clone();
        let node_id = node.id.clone();
        tokio::spawn(async move {
            if let Err(err) = writer_task.run(writer_cancel).await {
                error!(target: "ekko_supervisor::service", node_id, %err, "arrow writer exited with error");
            }
        });

        Arc::new(BlockFetcher::new(
            node.clone(),
            subscriber,
            rpc,
            data_bucket.clone(),
            decoder,
            watched,
            config.filter_wallets_enabled,
            writer,
            status_reporter_for(config_bucket.clone()),
        ))
    })
}

/// The main service structure for the supervisor control plane. Orchestrates the
/// `PipelineSupervisor` (which in turn owns the `FetcherSupervisor`, §3) as a single
/// `SupervisorActor`, tracked alongside every other spawned task in one `JoinSet`.
pub struct Service {
    config: Arc<ServiceConfig>,
    supervisor: Option<Arc<PipelineSupervisor<NatsMessageBus>>>,
    cancel_token: CancellationToken,
    join_set: JoinSet<Result<(), anyhow::Error>>,
}

impl Service {
    /// Creates a new Supervisor service instance. Connections are opened in [`Self::initialise`].
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config: Arc::new(config),
            supervisor: None,
            cancel_token: CancellationToken::new(),
            join_set: JoinSet::new(),
        }
    }

    fn build_object_store(&self) -> Result<impl ObjectStore> {
        let scheme = if self.config.minio_use_ssl { "https" } else { "http" };
        AmazonS3Builder::new()
            .with_endpoint(format!("{scheme}://{}", self.config.minio_endpoint))
            .with_access_key_id(&self.config.minio_access_key)
            .with_secret_access_key(&self.config.minio_secret_key)
            .with_bucket_name(&self.config.minio_bucket)
            .with_allow_http(!self.config.minio_use_ssl)
            .build()
            .map_err(|err| anyhow!("failed to build object store: {err}"))
    }

    /// Initialises the Supervisor service: connects to the bus, opens both key-value
    /// buckets, builds the object store, and spawns the `PipelineSupervisor` actor.
    pub async fn initialise(&mut self) -> Result<()> {
        info!(target: "ekko_supervisor::service", nats_url = %self.config.nats_url, "connecting to message bus");
        let bus = Arc::new(
            NatsMessageBus::connect(&self.config.nats_url)
                .await
                .map_err(|err| anyhow!("failed to connect to message bus: {err}"))?,
        );

        let jetstream = async_nats::jetstream::new(bus.client().clone());
        let config_bucket: Arc<dyn ConfigBucket> =
            Arc::new(NatsKvBucket::open(&jetstream, &self.config.config_bucket_name).await?);
        let data_bucket: Arc<dyn DataBucket> =
            Arc::new(NatsKvBucket::open(&jetstream, &self.config.data_bucket_name).await?);

        let store: Arc<dyn ObjectStore> = Arc::new(self.build_object_store()?);

        let head_source_factory: HeadSourceFactory = Arc::new(|node: &NodeConfig| -> Box<dyn HeadSource> {
            Box::new(WsHeadSource::new(node.wss_url.clone(), node.http_url.clone()))
        });

        let fetcher_cancel = self.cancel_token.child_token();
        let block_fetcher_factory = build_block_fetcher_factory(
            self.config.clone(),
            config_bucket.clone(),
            data_bucket,
            store,
            bus.clone(),
            self.cancel_token.clone(),
        );
        let fetcher_supervisor = Arc::new(FetcherSupervisor::new(block_fetcher_factory, fetcher_cancel));

        let supervisor = Arc::new(
            PipelineSupervisor::new(
                config_bucket,
                bus.clone(),
                head_source_factory,
                fetcher_supervisor.clone(),
                self.cancel_token.clone(),
            )
            .with_reconcile_trigger(bus),
        );
        self.supervisor = Some(supervisor.clone());

        let actor = PipelineSupervisorActor::new(supervisor.clone());
        self.join_set.spawn(async move {
            actor
                .start()
                .await
                .map_err(|err: SupervisorError| anyhow!("pipeline supervisor exited: {err}"))
        });

        // FetcherSupervisor's own periodic safety-net tick (§4.5), independent of
        // PipelineSupervisor's reconcile cycle: it re-derives the desired fetcher set from
        // the last-known enabled nodes, covering the case where a reconcile cycle aborts
        // before reaching `FetcherSupervisor::synchronize` (e.g. a bucket-list failure).
        self.join_set.spawn(async move {
            fetcher_supervisor
                .run(move || supervisor.enabled_nodes_snapshot())
                .await
                .map_err(|err| anyhow!("fetcher supervisor exited: {err}"))
        });

        Ok(())
    }

    /// Runs the Supervisor service. Returns once interrupted (`Ctrl+C`) or a tracked task
    /// fails; in the latter case every task is cancelled before returning the error.
    pub async fn run(&mut self) -> Result<()> {
        self.initialise().await?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!(target: "ekko_supervisor::service", "received shutdown signal");
                    return Ok(());
                }
                opt = self.join_set.join_next() => {
                    match opt {
                        Some(Ok(Ok(()))) => {
                            metrics::counter!("ekko_supervisor_service_task_completions_total").increment(1);
                            info!(target: "ekko_supervisor::service", "task completed successfully");
                        }
                        Some(Ok(Err(err))) => {
                            metrics::counter!("ekko_supervisor_service_task_failures_total").increment(1);
                            error!(target: "ekko_supervisor::service", %err, "a task encountered an error");
                            self.cancel_token.cancel();
                            return Err(err);
                        }
                        Some(Err(err)) => {
                            metrics::counter!("ekko_supervisor_service_task_failures_total").increment(1);
                            error!(target: "ekko_supervisor::service", %err, "a task panicked");
                            self.cancel_token.cancel();
                            return Err(anyhow!("a service task panicked: {err}"));
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Cancels every spawned task and waits for them to drain.
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel_token.cancel();

        while let Some(res) = self.join_set.join_next().await {
            match res {
                Ok(Ok(())) => {
                    info!(target: "ekko_supervisor::service", "task completed successfully during shutdown");
                }
                Ok(Err(err)) => {
                    error!(target: "ekko_supervisor::service", %err, "a task encountered an error during shutdown");
                }
                Err(err) => {
                    error!(target: "ekko_supervisor::service", %err, "a task panicked during shutdown");
                }
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for Service {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Service").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            nats_url: "nats://localhost:4222".into(),
            config_bucket_name: "ekko_nodes".into(),
            data_bucket_name: "ekko_fetcher_state".into(),
            filter_wallets_enabled: true,
            minio_endpoint: "localhost:9000".into(),
            minio_access_key: "minioadmin".into(),
            minio_secret_key: "minioadmin".into(),
            minio_bucket: "blockchain-data".into(),
            minio_use_ssl: false,
            object_store_base_path: "ekko".into(),
            batch_size: WriterConfig::DEFAULT_BATCH_SIZE,
            flush_interval: WriterConfig::DEFAULT_FLUSH_INTERVAL,
        }
    }

    #[test]
    fn build_object_store_succeeds_with_minio_defaults() {
        let service = Service::new(test_config());
        assert!(service.build_object_store().is_ok());
    }
}
