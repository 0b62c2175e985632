//! [`PipelineSupervisor`]: the top-level reconciler. Watches the config bucket, groups
//! enabled nodes into [`ManagedPipeline`]s by `(network, subnet, vmType)`, and hands the
//! full enabled-node list to its owned [`FetcherSupervisor`] on every cycle.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex},
};

use chrono::Utc;
use ekko_supervisor_types::{NodeConfig, NodeStatus, PipelineId};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bus::{MessageBus, ReconcileTrigger},
    error::{PipelineError, SupervisorError},
    fetcher::FetcherSupervisor,
    kv::ConfigBucket,
    pipeline::{HeadSourceFactory, ManagedPipeline, StatusReporter},
};

/// Periodic reconcile safety net (§4.1), merged with the config-bucket watch in one
/// `tokio::select!` loop rather than run as a separate code path.
const RECONCILE_TICK: std::time::Duration = std::time::Duration::from_secs(30);

/// Subject name for the optional event-driven reconcile tickle (§6).
const NODES_FANOUT_SUBJECT: &str = "nodes";

/// Key prefix every `NodeConfig` is stored under in the config bucket (§6).
const NODE_KEY_PREFIX: &str = "nodestore.";

/// Builds a [`ManagedPipeline`] for a newly-observed `(network, subnet, vmType)` group.
/// Production code supplies a closure that wires the real bus and [`HeadSourceFactory`];
/// tests substitute one wired to a scripted `HeadSource` (§4.2).
pub type NewManagedPipelineFunc<B> =
    Arc<dyn Fn(String, String, String, Vec<NodeConfig>) -> Arc<ManagedPipeline<B>> + Send + Sync>;

struct PipelineHandle<B: MessageBus> {
    pipeline: Arc<ManagedPipeline<B>>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), PipelineError>>,
}

/// Watches the config key-value bucket and converges the set of running
/// [`ManagedPipeline`]s and the owned [`FetcherSupervisor`] to match it.
pub struct PipelineSupervisor<B: MessageBus> {
    config_bucket: Arc<dyn ConfigBucket>,
    pipelines: Mutex<HashMap<PipelineId, PipelineHandle<B>>>,
    pipeline_factory: NewManagedPipelineFunc<B>,
    nodes_cache: Arc<SyncMutex<HashMap<String, NodeConfig>>>,
    fetcher_supervisor: Arc<FetcherSupervisor>,
    reconcile_trigger: Option<Arc<dyn ReconcileTrigger>>,
    cancel: CancellationToken,
}

impl<B: MessageBus + 'static> PipelineSupervisor<B> {
    /// Wires a supervisor against the production config bucket, bus, and `HeadSource`
    /// factory. `fetcher_supervisor` is owned from here on (§3): its lifecycle is driven
    /// entirely by this supervisor's reconcile cycle and `cancel`.
    pub fn new(
        config_bucket: Arc<dyn ConfigBucket>,
        bus: Arc<B>,
        head_source_factory: HeadSourceFactory,
        fetcher_supervisor: Arc<FetcherSupervisor>,
        cancel: CancellationToken,
    ) -> Self {
        let nodes_cache: Arc<SyncMutex<HashMap<String, NodeConfig>>> = Arc::new(SyncMutex::new(HashMap::new()));

        let status_reporter: StatusReporter = {
            let config_bucket = config_bucket.clone();
            let nodes_cache = nodes_cache.clone();
            Arc::new(move |node_id: &str, status: NodeStatus| {
                let config_bucket = config_bucket.clone();
                let nodes_cache = nodes_cache.clone();
                let node_id = node_id.to_owned();
                tokio::spawn(async move {
                    let Some(node) = nodes_cache.lock().unwrap_or_else(|e| e.into_inner()).get(&node_id).cloned() else {
                        return;
                    };
                    let updated = node.with_status(status, Utc::now());
                    let bytes = match updated.to_bucket_value() {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            error!(target: "ekko_supervisor::supervisor", %err, "failed to serialize node status update");
                            return;
                        }
                    };
                    if let Err(err) = config_bucket.put(&updated.bucket_key(), bytes).await {
                        error!(target: "ekko_supervisor::supervisor", node_id = %node_id, %err, "failed to write node status back to config bucket");
                    }
                });
            })
        };

        let pipeline_factory: NewManagedPipelineFunc<B> = {
            let bus = bus.clone();
            Arc::new(move |network, subnet, vm_type, nodes| {
                Arc::new(ManagedPipeline::new(
                    network,
                    subnet,
                    vm_type,
                    nodes,
                    bus.clone(),
                    head_source_factory.clone(),
                    status_reporter.clone(),
                ))
            })
        };

        Self {
            config_bucket,
            pipelines: Mutex::new(HashMap::new()),
            pipeline_factory,
            nodes_cache,
            fetcher_supervisor,
            reconcile_trigger: None,
            cancel,
        }
    }

    /// Subscribes this supervisor to the optional `nodes` fanout subject (§6): any message
    /// published there forces an immediate `synchronize`, independent of the config-bucket
    /// watch and periodic tick. Not subscribed by default — production wiring opts in once
    /// the bus connection is available.
    pub fn with_reconcile_trigger(mut self, trigger: Arc<dyn ReconcileTrigger>) -> Self {
        self.reconcile_trigger = Some(trigger);
        self
    }

    /// Snapshot of the enabled nodes observed on the most recent `synchronize` cycle.
    /// Lets the owned [`FetcherSupervisor`] run its own independent safety-net tick
    /// (§4.5) against the last-known node set, rather than depending solely on this
    /// supervisor's own reconcile cycle feeding it.
    pub fn enabled_nodes_snapshot(&self) -> Vec<NodeConfig> {
        self.nodes_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|node| node.is_enabled)
            .cloned()
            .collect()
    }

    /// Runs the merged watch+tick reconcile loop until `cancel` fires, then drains every
    /// running pipeline.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let mut watch = self.config_bucket.watch_all(NODE_KEY_PREFIX).await?;
        let mut ticker = tokio::time::interval(RECONCILE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut nodes_tickle = match &self.reconcile_trigger {
            Some(trigger) => match trigger.subscribe(NODES_FANOUT_SUBJECT).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target: "ekko_supervisor::supervisor", %err, "failed to subscribe to nodes fanout subject, relying on watch and tick only");
                    Box::pin(futures::stream::pending())
                }
            },
            None => Box::pin(futures::stream::pending()),
        };

        self.synchronize().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.stop_all().await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.synchronize().await;
                }
                event = watch.next() => {
                    if event.is_some() {
                        self.synchronize().await;
                    } else {
                        warn!(target: "ekko_supervisor::supervisor", "config bucket watch ended, relying on periodic tick");
                    }
                }
                tickle = nodes_tickle.next() => {
                    if tickle.is_some() {
                        debug!(target: "ekko_supervisor::supervisor", "nodes fanout tickle received, forcing reconcile");
                        self.synchronize().await;
                    } else {
                        warn!(target: "ekko_supervisor::supervisor", "nodes fanout subscription ended, relying on watch and tick");
                    }
                }
            }
        }
    }

    /// One reconcile cycle: lists the config bucket, groups nodes by pipeline id, and
    /// converges the pipeline map and `FetcherSupervisor` to match. A bucket-list failure
    /// is logged and the cycle is abandoned — the next tick or watch event retries.
    pub async fn synchronize(&self) {
        let keys = match self.config_bucket.list_keys(NODE_KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(err) => {
                error!(target: "ekko_supervisor::supervisor", %err, "failed to list config bucket, aborting this reconcile cycle");
                return;
            }
        };

        let mut nodes: Vec<NodeConfig> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.config_bucket.get(&key).await {
                Ok(Some(bytes)) => match NodeConfig::from_bucket_value(&bytes) {
                    Ok(node) => nodes.push(node),
                    Err(err) => warn!(target: "ekko_supervisor::supervisor", key = %key, %err, "skipping malformed node record"),
                },
                Ok(None) => {}
                Err(err) => {
                    error!(target: "ekko_supervisor::supervisor", key = %key, %err, "failed to read node record, aborting this reconcile cycle");
                    return;
                }
            }
        }

        {
            let mut cache = self.nodes_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.clear();
            for node in &nodes {
                cache.insert(node.id.clone(), node.clone());
            }
        }

        let mut groups: HashMap<PipelineId, Vec<NodeConfig>> = HashMap::new();
        for node in nodes.iter().cloned() {
            groups.entry(node.pipeline_id()).or_default().push(node);
        }

        let stale: Vec<PipelineId> = {
            let pipelines = self.pipelines.lock().await;
            pipelines.keys().filter(|id| !groups.contains_key(*id)).cloned().collect()
        };
        for id in stale {
            let handle = {
                let mut pipelines = self.pipelines.lock().await;
                pipelines.remove(&id)
            };
            if let Some(handle) = handle {
                self.stop_pipeline(handle).await;
            }
        }

        for (pipeline_id, group_nodes) in groups {
            let exists = self.pipelines.lock().await.contains_key(&pipeline_id);
            if !exists {
                let Some(first) = group_nodes.first() else { continue };
                let pipeline = (self.pipeline_factory)(
                    first.network.clone(),
                    first.subnet.clone(),
                    first.vm_type.as_str().to_owned(),
                    group_nodes.clone(),
                );
                let child_cancel = self.cancel.child_token();
                let run_pipeline = pipeline.clone();
                let run_cancel = child_cancel.clone();
                let handle = tokio::spawn(async move { run_pipeline.run(run_cancel).await });

                if let Err(err) = pipeline.update_node_configs(group_nodes).await {
                    debug!(target: "ekko_supervisor::supervisor", pipeline = %pipeline_id, %err, "initial pipeline start did not yield an active node");
                }

                self.pipelines.lock().await.insert(pipeline_id.clone(), PipelineHandle { pipeline, cancel: child_cancel, handle });
                info!(target: "ekko_supervisor::supervisor", pipeline = %pipeline_id, "started managed pipeline");
            } else {
                let pipeline = {
                    let pipelines = self.pipelines.lock().await;
                    pipelines.get(&pipeline_id).map(|handle| handle.pipeline.clone())
                };
                if let Some(pipeline) = pipeline {
                    if let Err(err) = pipeline.update_node_configs(group_nodes).await {
                        debug!(target: "ekko_supervisor::supervisor", pipeline = %pipeline_id, %err, "reconcile did not yield an active node");
                    }
                }
            }
        }

        self.fetcher_supervisor.synchronize(nodes.into_iter().filter(|node| node.is_enabled).collect()).await;
    }

    async fn stop_pipeline(&self, handle: PipelineHandle<B>) {
        handle.pipeline.stop().await;
        handle.cancel.cancel();
        let _ = handle.handle.await;
    }

    async fn stop_all(&self) {
        let handles: Vec<PipelineHandle<B>> = {
            let mut pipelines = self.pipelines.lock().await;
            pipelines.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            self.stop_pipeline(handle).await;
        }
    }
}

impl<B: MessageBus> core::fmt::Debug for PipelineSupervisor<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineSupervisor").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::KvError, headsource::ScriptedHeadSource, kv::WatchEvent};
    use ekko_supervisor_types::VmType;
    use futures::stream::BoxStream;

    fn node(id: &str, network: &str, enabled: bool) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            network: network.into(),
            subnet: "mainnet".into(),
            vm_type: VmType::Evm,
            http_url: "http://localhost:8545".into(),
            wss_url: "ws://localhost:8546".into(),
            is_enabled: enabled,
            status: NodeStatus::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Debug, Default)]
    struct InMemoryConfigBucket {
        values: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl InMemoryConfigBucket {
        async fn insert(&self, node: &NodeConfig) {
            self.values.lock().await.insert(node.bucket_key(), node.to_bucket_value().unwrap());
        }
    }

    #[async_trait::async_trait]
    impl ConfigBucket for InMemoryConfigBucket {
        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
            Ok(self.values.lock().await.keys().filter(|key| key.starts_with(prefix)).cloned().collect())
        }
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
            Ok(self.values.lock().await.get(key).cloned())
        }
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
            self.values.lock().await.insert(key.to_owned(), value);
            Ok(())
        }
        async fn watch_all(&self, _prefix: &str) -> Result<BoxStream<'static, WatchEvent>, KvError> {
            Ok(Box::pin(futures::stream::pending()))
        }
    }

    #[derive(Debug, Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), crate::error::BusError> {
            self.published.lock().await.push((subject, payload));
            Ok(())
        }
    }

    fn scripted_factory() -> HeadSourceFactory {
        Arc::new(|_node| Box::new(ScriptedHeadSource::new(vec![])))
    }

    #[tokio::test]
    async fn synchronize_groups_nodes_into_pipelines() {
        let bucket = Arc::new(InMemoryConfigBucket::default());
        bucket.insert(&node("n1", "ethereum", true)).await;
        bucket.insert(&node("n2", "polygon", true)).await;

        let fetcher_supervisor = Arc::new(FetcherSupervisor::new(Arc::new(|_node: &NodeConfig| -> Arc<crate::fetcher::BlockFetcher> { unreachable!() }), CancellationToken::new()));
        let supervisor = PipelineSupervisor::new(
            bucket,
            Arc::new(RecordingBus::default()),
            scripted_factory(),
            fetcher_supervisor,
            CancellationToken::new(),
        );

        supervisor.synchronize().await;
        assert_eq!(supervisor.pipelines.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn synchronize_removes_pipeline_when_nodes_disappear() {
        let bucket = Arc::new(InMemoryConfigBucket::default());
        bucket.insert(&node("n1", "ethereum", true)).await;

        let fetcher_supervisor = Arc::new(FetcherSupervisor::new(Arc::new(|_node: &NodeConfig| -> Arc<crate::fetcher::BlockFetcher> { unreachable!() }), CancellationToken::new()));
        let supervisor = PipelineSupervisor::new(
            bucket.clone(),
            Arc::new(RecordingBus::default()),
            scripted_factory(),
            fetcher_supervisor,
            CancellationToken::new(),
        );

        supervisor.synchronize().await;
        assert_eq!(supervisor.pipelines.lock().await.len(), 1);

        bucket.values.lock().await.clear();
        supervisor.synchronize().await;
        assert_eq!(supervisor.pipelines.lock().await.len(), 0);
    }

    fn make_supervisor(
        bucket: Arc<InMemoryConfigBucket>,
    ) -> PipelineSupervisor<RecordingBus> {
        make_supervisor_with_cancel(bucket, CancellationToken::new())
    }

    fn make_supervisor_with_cancel(
        bucket: Arc<InMemoryConfigBucket>,
        cancel: CancellationToken,
    ) -> PipelineSupervisor<RecordingBus> {
        let fetcher_supervisor = Arc::new(FetcherSupervisor::new(
            Arc::new(|_node: &NodeConfig| -> Arc<crate::fetcher::BlockFetcher> { unreachable!() }),
            cancel.clone(),
        ));
        PipelineSupervisor::new(
            bucket,
            Arc::new(RecordingBus::default()),
            scripted_factory(),
            fetcher_supervisor,
            cancel,
        )
    }

    /// Scenario 2 (§8): updating a node's URL reaches the same pipeline instance via a
    /// second `UpdateNodeConfigs` call, rather than spinning up a new one.
    #[tokio::test]
    async fn synchronize_reuses_pipeline_instance_across_url_update() {
        let bucket = Arc::new(InMemoryConfigBucket::default());
        bucket.insert(&node("n1", "ethereum", true)).await;

        let supervisor = make_supervisor(bucket.clone());
        supervisor.synchronize().await;
        let first = {
            let pipelines = supervisor.pipelines.lock().await;
            Arc::as_ptr(&pipelines.get(&PipelineId::new("ethereum", "mainnet", "evm")).unwrap().pipeline) as usize
        };

        let mut updated = node("n1", "ethereum", true);
        updated.http_url = "http://updated:8545".into();
        bucket.insert(&updated).await;
        supervisor.synchronize().await;

        let second = {
            let pipelines = supervisor.pipelines.lock().await;
            assert_eq!(pipelines.len(), 1);
            Arc::as_ptr(&pipelines.get(&PipelineId::new("ethereum", "mainnet", "evm")).unwrap().pipeline) as usize
        };
        assert_eq!(first, second, "same pipeline instance must be reused across a URL-only update");
    }

    /// Scenario 4 (§8): disabling then re-enabling a node recreates the pipeline as a
    /// distinct instance rather than reviving the stopped one.
    #[tokio::test]
    async fn disable_then_reenable_yields_distinct_pipeline_instance() {
        let bucket = Arc::new(InMemoryConfigBucket::default());
        bucket.insert(&node("n1", "ethereum", true)).await;

        let supervisor = make_supervisor(bucket.clone());
        supervisor.synchronize().await;
        let first = {
            let pipelines = supervisor.pipelines.lock().await;
            Arc::as_ptr(&pipelines.get(&PipelineId::new("ethereum", "mainnet", "evm")).unwrap().pipeline) as usize
        };

        bucket.insert(&node("n1", "ethereum", false)).await;
        supervisor.synchronize().await;
        assert!(supervisor.pipelines.lock().await.get(&PipelineId::new("ethereum", "mainnet", "evm")).is_none());

        bucket.insert(&node("n1", "ethereum", true)).await;
        supervisor.synchronize().await;
        let second = {
            let pipelines = supervisor.pipelines.lock().await;
            Arc::as_ptr(&pipelines.get(&PipelineId::new("ethereum", "mainnet", "evm")).unwrap().pipeline) as usize
        };
        assert_ne!(first, second, "re-enabling must create a new pipeline instance, not revive the old one");
    }

    #[derive(Debug, Default)]
    struct ScriptedReconcileTrigger {
        fired: std::sync::Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl crate::bus::ReconcileTrigger for ScriptedReconcileTrigger {
        async fn subscribe(&self, _subject: &str) -> Result<BoxStream<'static, ()>, crate::error::BusError> {
            let fired = self.fired.clone();
            Ok(Box::pin(futures::stream::unfold(fired, |fired| async move {
                fired.notified().await;
                Some(((), fired))
            })))
        }
    }

    /// §6: a message on the optional `nodes` fanout subject forces an out-of-cycle
    /// reconcile, independent of the config-bucket watch and periodic tick.
    #[tokio::test]
    async fn nodes_fanout_tickle_forces_reconcile() {
        let bucket = Arc::new(InMemoryConfigBucket::default());
        let trigger = Arc::new(ScriptedReconcileTrigger::default());
        let cancel = CancellationToken::new();
        let supervisor =
            Arc::new(make_supervisor_with_cancel(bucket.clone(), cancel.clone()).with_reconcile_trigger(trigger.clone()));

        let run_supervisor = supervisor.clone();
        let handle = tokio::spawn(async move { run_supervisor.run().await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bucket.insert(&node("n1", "ethereum", true)).await;
        trigger.fired.notify_one();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(supervisor.pipelines.lock().await.len(), 1);

        cancel.cancel();
        let _ = handle.await;
    }
}
