//! [`ManagedPipeline`]: owns one live upstream subscription for a `(network, subnet,
//! vmType)` group and republishes its head events to the bus.

use std::sync::Arc;

use ekko_supervisor_types::{ActiveNodeSelection, NewHeadEvent, NodeConfig, NodeStatus, PipelineId};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    bus::MessageBus,
    error::PipelineError,
    headsource::HeadSource,
};

/// States a [`ManagedPipeline`] moves through over its lifetime. See §4.4 for the
/// transition table; `Reconfiguring` is transient within a single `UpdateNodeConfigs`
/// call and the pipeline always settles back to `Active` or `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Constructed but the `HeadSource` has not yet started successfully.
    Initializing,
    /// Driving a live `HeadSource` and publishing its events.
    Active,
    /// Mid-`UpdateNodeConfigs`, tearing down and restarting the source.
    Reconfiguring,
    /// `Stop()` was called, or the last enabled node was removed; winding down.
    Draining,
    /// Fully torn down; the pipeline will not start again.
    Stopped,
}

/// One-way status-reporting capability: child reports, parent (the supervisor) writes.
/// Never a back-reference to the whole supervisor, per §9's cyclic-callback note.
pub type StatusReporter = Arc<dyn Fn(&str, NodeStatus) + Send + Sync>;

/// Builds the [`HeadSource`] used to drive a given active node. Substituted with a
/// scripted factory in tests; production wires [`crate::headsource::WsHeadSource::new`].
pub type HeadSourceFactory = Arc<dyn Fn(&NodeConfig) -> Box<dyn HeadSource> + Send + Sync>;

/// Selects the active node from a group: iterating from the newest entry (the end of the
/// caller-supplied slice) and returning the first enabled one. `None` if no node in the
/// group is enabled. Pure and order-sensitive — the caller controls "newest" by the order
/// it passes nodes in (see the Open Question in §9: insertion/list order, not
/// `created_at`).
pub fn select_active(nodes: &[NodeConfig]) -> Option<&NodeConfig> {
    nodes.iter().rev().find(|node| node.is_enabled)
}

struct Inner {
    state: PipelineState,
    nodes: Vec<NodeConfig>,
    active: Option<ActiveNodeSelection>,
    source: Option<Box<dyn HeadSource>>,
}

/// Owns one live upstream for a `(network, subnet, vmType)` group.
pub struct ManagedPipeline<B: MessageBus> {
    pipeline_id: PipelineId,
    network: String,
    subnet: String,
    vm_type: String,
    inner: Mutex<Inner>,
    bus: Arc<B>,
    head_source_factory: HeadSourceFactory,
    status_reporter: StatusReporter,
}

impl<B: MessageBus + 'static> ManagedPipeline<B> {
    /// Constructs a pipeline for `(network, subnet, vmType)` with its initial node set.
    /// Matches the shape of `newManagedPipelineFunc` (§4.2), minus the decoder client —
    /// decoding is a `BlockFetcher`-only concern (§4.6), so it is not threaded through here.
    pub fn new(
        network: String,
        subnet: String,
        vm_type: String,
        initial_nodes: Vec<NodeConfig>,
        bus: Arc<B>,
        head_source_factory: HeadSourceFactory,
        status_reporter: StatusReporter,
    ) -> Self {
        let pipeline_id = PipelineId::new(&network, &subnet, &vm_type);
        Self {
            pipeline_id,
            network,
            subnet,
            vm_type,
            inner: Mutex::new(Inner {
                state: PipelineState::Initializing,
                nodes: initial_nodes,
                active: None,
                source: None,
            }),
            bus,
            head_source_factory,
            status_reporter,
        }
    }

    /// This pipeline's id.
    pub fn pipeline_id(&self) -> &PipelineId {
        &self.pipeline_id
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> PipelineState {
        self.inner.lock().await.state
    }

    fn subject(&self) -> String {
        format!("{}.{}.{}.newheads", self.network, self.subnet, self.vm_type)
    }

    fn report(&self, node_id: &str, status: NodeStatus) {
        if !node_id.is_empty() {
            (self.status_reporter)(node_id, status);
        }
    }

    /// Runs the pipeline until `cancel` fires or the `HeadSource` channel closes
    /// unexpectedly. The initial `HeadSource` start happens via the first
    /// [`Self::update_node_configs`] call made by the owning `PipelineSupervisor`
    /// immediately after construction; `run` only drives the consume-and-republish loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), PipelineError> {
        let subject = self.subject();

        loop {
            let mut receiver = {
                let mut inner = self.inner.lock().await;
                match inner.source.as_mut() {
                    Some(source) => source.out(),
                    None => {
                        // No active source yet (e.g. last start attempt failed). Wait for
                        // the next reconcile's `update_node_configs` to retry, observing
                        // cancellation in the meantime.
                        drop(inner);
                        tokio::select! {
                            () = cancel.cancelled() => {
                                self.drain().await;
                                return Ok(());
                            }
                            () = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        self.drain().await;
                        return Ok(());
                    }
                    event = receiver.recv() => {
                        match event {
                            Some(event) => self.handle_event(&subject, event).await,
                            None => {
                                warn!(target: "ekko_supervisor::pipeline", pipeline = %self.pipeline_id, "head source channel closed unexpectedly");
                                let active_id = self.inner.lock().await.active.as_ref().map(|n| n.node_id().to_string());
                                if let Some(id) = active_id {
                                    self.report(&id, NodeStatus::Unhealthy);
                                }
                                return Err(PipelineError::ChannelClosed);
                            }
                        }
                        continue;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, subject: &str, mut event: NewHeadEvent) {
        let active_id = { self.inner.lock().await.active.as_ref().map(|n| n.node_id().to_string()) };
        let Some(active_id) = active_id else { return };

        event.stamp_node_id(&active_id);

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(err) => {
                error!(target: "ekko_supervisor::pipeline", pipeline = %self.pipeline_id, %err, "failed to serialize head event");
                self.report(&active_id, NodeStatus::Unhealthy);
                return;
            }
        };

        if let Err(err) = self.bus.publish(subject.to_owned(), payload).await {
            error!(target: "ekko_supervisor::pipeline", pipeline = %self.pipeline_id, %err, "failed to publish head event");
            self.report(&active_id, NodeStatus::Unhealthy);
        }
    }

    /// Stops the pipeline: transitions through `Draining` to `Stopped`, closing the
    /// active source. Idempotent.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = PipelineState::Draining;
        if let Some(source) = inner.source.as_mut() {
            source.close().await;
        }
        inner.source = None;
        inner.state = PipelineState::Stopped;
    }

    async fn drain(&self) {
        self.stop().await;
    }

    /// Delivers the full current node set for this group (enabled and disabled) and
    /// converges the active selection and `HeadSource` accordingly. See §4.4 for the
    /// full contract; this is the only place pipeline state transitions besides `stop`.
    pub async fn update_node_configs(&self, nodes: Vec<NodeConfig>) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock().await;

        let new_active = select_active(&nodes).cloned();
        let previous_active = inner.active.clone();
        inner.nodes = nodes;

        let Some(new_active) = new_active else {
            debug!(target: "ekko_supervisor::pipeline", pipeline = %self.pipeline_id, "no enabled node, draining");
            if let Some(source) = inner.source.as_mut() {
                source.close().await;
            }
            inner.source = None;
            inner.active = None;
            inner.state = PipelineState::Stopped;
            drop(inner);
            if let Some(previous) = previous_active {
                self.report(previous.node_id(), NodeStatus::Stale);
            }
            return Err(PipelineError::NoActiveNode);
        };

        let same_active_same_endpoints =
            previous_active.as_ref().is_some_and(|previous| previous.has_same_endpoints(&new_active));

        if same_active_same_endpoints {
            inner.active = Some(ActiveNodeSelection::new(new_active));
            return Ok(());
        }

        inner.state = PipelineState::Reconfiguring;

        let same_node_new_endpoints = previous_active.as_ref().is_some_and(|previous| previous.node_id() == new_active.id);

        let result = if same_node_new_endpoints {
            if let Some(source) = inner.source.as_mut() {
                source.update_endpoints(new_active.wss_url.clone(), new_active.http_url.clone()).await;
                source.close().await;
            }
            self.restart_source(&mut inner, &new_active).await
        } else {
            if let Some(source) = inner.source.as_mut() {
                source.close().await;
            }
            self.restart_source(&mut inner, &new_active).await
        };

        match result {
            Ok(()) => {
                inner.active = Some(ActiveNodeSelection::new(new_active.clone()));
                inner.state = PipelineState::Active;
                drop(inner);
                self.report(&new_active.id, NodeStatus::Active);
                if let Some(previous) = previous_active {
                    if previous.node_id() != new_active.id {
                        self.report(previous.node_id(), NodeStatus::Stale);
                    }
                }
                Ok(())
            }
            Err(err) => {
                inner.active = None;
                inner.source = None;
                drop(inner);
                self.report(&new_active.id, NodeStatus::Error(err.to_string()));
                if let Some(previous) = previous_active {
                    self.report(previous.node_id(), NodeStatus::Stale);
                }
                Err(err)
            }
        }
    }

    async fn restart_source(&self, inner: &mut Inner, active: &NodeConfig) -> Result<(), PipelineError> {
        let mut source = (self.head_source_factory)(active);
        source.start(CancellationToken::new()).await?;
        inner.source = Some(source);
        Ok(())
    }
}

impl<B: MessageBus> core::fmt::Debug for ManagedPipeline<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ManagedPipeline").field("pipeline_id", &self.pipeline_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headsource::ScriptedHeadSource;
    use chrono::Utc;

    fn node(id: &str, enabled: bool, wss: &str) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            network: "a".into(),
            subnet: "s".into(),
            vm_type: ekko_supervisor_types::VmType::Evm,
            http_url: format!("http://{wss}"),
            wss_url: format!("ws://{wss}"),
            is_enabled: enabled,
            status: NodeStatus::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
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

    #[test]
    fn select_active_picks_newest_enabled() {
        let nodes = vec![node("n1", true, "w1"), node("n2", true, "w2")];
        assert_eq!(select_active(&nodes).unwrap().id, "n2");
    }

    #[test]
    fn select_active_skips_disabled_tail() {
        let nodes = vec![node("n1", true, "w1"), node("n2", false, "w2")];
        assert_eq!(select_active(&nodes).unwrap().id, "n1");
    }

    #[test]
    fn select_active_none_when_nothing_enabled() {
        let nodes = vec![node("n1", false, "w1")];
        assert!(select_active(&nodes).is_none());
    }

    #[tokio::test]
    async fn update_node_configs_starts_source_and_reports_active() {
        let reporter: StatusReporter = Arc::new(|_, _| {});

        let pipeline = ManagedPipeline::new(
            "a".into(),
            "s".into(),
            "evm".into(),
            vec![],
            Arc::new(RecordingBus::default()),
            scripted_factory(),
            reporter,
        );

        pipeline.update_node_configs(vec![node("n1", true, "w1")]).await.unwrap();
        assert_eq!(pipeline.state().await, PipelineState::Active);
    }

    #[tokio::test]
    async fn update_node_configs_empty_set_stops_pipeline() {
        let reporter: StatusReporter = Arc::new(|_, _| {});
        let pipeline = ManagedPipeline::new(
            "a".into(),
            "s".into(),
            "evm".into(),
            vec![],
            Arc::new(RecordingBus::default()),
            scripted_factory(),
            reporter,
        );

        pipeline.update_node_configs(vec![node("n1", true, "w1")]).await.unwrap();
        let err = pipeline.update_node_configs(vec![node("n1", false, "w1")]).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoActiveNode));
        assert_eq!(pipeline.state().await, PipelineState::Stopped);
    }

    #[tokio::test]
    async fn failover_switches_active_on_disable() {
        let reporter: StatusReporter = Arc::new(|_, _| {});
        let pipeline = ManagedPipeline::new(
            "a".into(),
            "s".into(),
            "evm".into(),
            vec![],
            Arc::new(RecordingBus::default()),
            scripted_factory(),
            reporter,
        );

        pipeline
            .update_node_configs(vec![node("n1", true, "w1"), node("n2", true, "w2")])
            .await
            .unwrap();
        assert_eq!(pipeline.inner.lock().await.active.as_ref().unwrap().node_id(), "n2");

        pipeline
            .update_node_configs(vec![node("n1", true, "w1"), node("n2", false, "w2")])
            .await
            .unwrap();
        assert_eq!(pipeline.inner.lock().await.active.as_ref().unwrap().node_id(), "n1");
    }

    #[tokio::test]
    async fn events_are_stamped_and_published() {
        let bus = Arc::new(RecordingBus::default());
        let reporter: StatusReporter = Arc::new(|_, _| {});
        let factory: HeadSourceFactory = Arc::new(|_node| {
            Box::new(ScriptedHeadSource::new(vec![NewHeadEvent {
                block_hash: "0x1".into(),
                block_number: 1,
                parent_hash: "0x0".into(),
                timestamp: Utc::now(),
                node_id: String::new(),
            }]))
        });

        let pipeline = Arc::new(ManagedPipeline::new(
            "a".into(),
            "s".into(),
            "evm".into(),
            vec![],
            bus.clone(),
            factory,
            reporter,
        ));

        pipeline.update_node_configs(vec![node("n1", true, "w1")]).await.unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let pipeline_clone = pipeline.clone();
        let handle = tokio::spawn(async move { pipeline_clone.run(cancel_clone).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = handle.await;

        let published = bus.published.lock().await;
        assert_eq!(published.len(), 1);
        let event: NewHeadEvent = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(event.node_id, "n1");
    }
}
