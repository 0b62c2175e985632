//! [`FetcherSupervisor`] and [`BlockFetcher`]: the transaction-ingestion half of the
//! control plane, run in parallel with the head-event half (`pipeline.rs`).

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ekko_supervisor_types::{DecodedCall, NewHeadEvent, NodeConfig, NodeStatus, TransactionRecord};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bus::MessageBus,
    error::FetcherError,
    kv::DataBucket,
    pipeline::StatusReporter,
    writer::ArrowWriter,
};

/// Hard RPC timeout per §5: each block fetch gets 10s and up to 3 attempts total.
const RPC_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const MAX_RPC_ATTEMPTS: u32 = 3;

/// Periodic reconcile safety net, identical in purpose to `PipelineSupervisor`'s (§4.5).
const RECONCILE_TICK: std::time::Duration = std::time::Duration::from_secs(15);

/// A fully-materialized block and its transactions, as returned by [`BlockRpcClient`].
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub hash: String,
    pub number: u64,
    pub transactions: Vec<FetchedTransaction>,
}

/// One transaction as read off the wire, before decoding or filtering.
#[derive(Debug, Clone)]
pub struct FetchedTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub value: u128,
    pub gas: u64,
    pub input: Vec<u8>,
}

/// An RPC client capable of fetching a block and its full transactions by hash. External
/// collaborator per §1 scope; [`AlloyBlockRpcClient`] is the production implementation.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait BlockRpcClient: Send + Sync + core::fmt::Debug {
    async fn get_block_by_hash(&self, block_hash: &str) -> Result<FetchedBlock, FetcherError>;
}

/// A subscription onto a pipeline's published head subject, narrower than [`MessageBus`]
/// (publish-only) — see the note on `MessageBus` for why this lives as its own trait.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait HeadSubscriber: Send + Sync + core::fmt::Debug {
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, NewHeadEvent>, FetcherError>;
}

/// Resolves decoded call data against an external decoder/address-lookup service.
/// External collaborator per §1 scope; never implemented beyond [`NoopDecoder`], the
/// pass-through used when no decoder is configured.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait Decoder: Send + Sync + core::fmt::Debug {
    async fn decode(&self, input: &[u8]) -> Option<DecodedCall>;
}

/// A decoder that never resolves a call. The default when no decoder is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDecoder;

#[async_trait]
impl Decoder for NoopDecoder {
    async fn decode(&self, _input: &[u8]) -> Option<DecodedCall> {
        None
    }
}

/// Tests whether an address belongs to the watched-address set (§1's "external watched
/// set"). Consulted only when `filterWalletsEnabled` is true.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait WatchedAddresses: Send + Sync + core::fmt::Debug {
    async fn is_watched(&self, address: &str) -> bool;
}

/// A watched-address set that treats every address as watched. Used whenever
/// `filterWalletsEnabled` is false.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAddresses;

#[async_trait]
impl WatchedAddresses for AllowAllAddresses {
    async fn is_watched(&self, _address: &str) -> bool {
        true
    }
}

/// Production [`BlockRpcClient`]: `eth_getBlockByHash` with full transaction objects over
/// the node's HTTP RPC endpoint (§4.6).
#[derive(Debug)]
pub struct AlloyBlockRpcClient {
    http_url: String,
}

impl AlloyBlockRpcClient {
    /// Builds a client pointed at `http_url`. Connects lazily, once per call, mirroring
    /// `WsHeadSource`'s HTTP fallback rather than holding a long-lived provider handle.
    pub fn new(http_url: String) -> Self {
        Self { http_url }
    }
}

#[async_trait]
impl BlockRpcClient for AlloyBlockRpcClient {
    async fn get_block_by_hash(&self, block_hash: &str) -> Result<FetchedBlock, FetcherError> {
        ekko_supervisor_metrics::observe_metrics_for_result_async!(
            "ekko_supervisor_rpc_success_total",
            "ekko_supervisor_rpc_error_total",
            "ekko_supervisor_rpc_duration_seconds",
            "eth_getBlockByHash",
            async {
                use alloy_consensus::Transaction as _;
                use alloy_provider::{Provider, ProviderBuilder};

                let hash: alloy_primitives::B256 = block_hash
                    .parse()
                    .map_err(|_| FetcherError::Rpc(format!("invalid block hash: {block_hash}")))?;

                let provider = ProviderBuilder::new()
                    .connect(&self.http_url)
                    .await
                    .map_err(|err| FetcherError::Rpc(err.to_string()))?;

                let block = provider
                    .get_block_by_hash(hash)
                    .full()
                    .await
                    .map_err(|err| FetcherError::Rpc(err.to_string()))?
                    .ok_or_else(|| FetcherError::Rpc("block not found".into()))?;

                let transactions = block
                    .transactions
                    .into_transactions()
                    .map(|tx| FetchedTransaction {
                        hash: tx.inner.hash().to_string(),
                        from: tx.inner.signer().to_string(),
                        to: tx.to().map(|addr| addr.to_string()),
                        value: tx.value().to::<u128>(),
                        gas: tx.gas_limit(),
                        input: tx.input().to_vec(),
                    })
                    .collect();

                Ok(FetchedBlock { hash: block.header.hash.to_string(), number: block.header.number, transactions })
            }
        )
    }
}

/// Production [`HeadSubscriber`]: a core NATS subscription to the pipeline-published head
/// subject, deserializing each message as a [`NewHeadEvent`] and dropping malformed ones.
#[derive(Debug, Clone)]
pub struct NatsHeadSubscriber {
    client: async_nats::Client,
}

impl NatsHeadSubscriber {
    /// Wraps an already-connected NATS client.
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HeadSubscriber for NatsHeadSubscriber {
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, NewHeadEvent>, FetcherError> {
        let subscription = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|err| FetcherError::Bus(crate::error::BusError::Subscribe(err.to_string())))?;

        let stream = futures::StreamExt::filter_map(subscription, |message| async move {
            match serde_json::from_slice::<NewHeadEvent>(&message.payload) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(target: "ekko_supervisor::fetcher", %err, "dropping malformed head event");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Cursor {
    block_hash: String,
    block_number: u64,
}

/// Builds a per-node [`ArrowWriter`] config from the node's grouping triple and id — kept
/// as a function rather than a fixed struct since `batchSize`/`flushInterval`/object-store
/// settings are process-wide but the base path varies per node.
pub type ArrowWriterConfigFactory = dyn Fn(&NodeConfig) -> crate::writer::WriterConfig + Send + Sync;

/// For one node, consumes head references and produces fully-materialized
/// [`TransactionRecord`]s, handing surviving ones to its [`ArrowWriter`].
pub struct BlockFetcher {
    node: NodeConfig,
    subject: String,
    subscriber: Arc<dyn HeadSubscriber>,
    rpc: Arc<dyn BlockRpcClient>,
    cursor_bucket: Arc<dyn DataBucket>,
    decoder: Arc<dyn Decoder>,
    watched: Arc<dyn WatchedAddresses>,
    filter_wallets_enabled: bool,
    writer: Arc<ArrowWriter<dyn MessageBus>>,
    status_reporter: StatusReporter,
}

impl BlockFetcher {
    /// Builds a fetcher for one node. `writer` is exclusively owned by this fetcher (§3)
    /// and is not shared with any other `BlockFetcher` or `ManagedPipeline`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeConfig,
        subscriber: Arc<dyn HeadSubscriber>,
        rpc: Arc<dyn BlockRpcClient>,
        cursor_bucket: Arc<dyn DataBucket>,
        decoder: Arc<dyn Decoder>,
        watched: Arc<dyn WatchedAddresses>,
        filter_wallets_enabled: bool,
        writer: Arc<ArrowWriter<dyn MessageBus>>,
        status_reporter: StatusReporter,
    ) -> Self {
        let subject = format!("{}.{}.{}.newheads", node.network, node.subnet, node.vm_type);
        Self { node, subject, subscriber, rpc, cursor_bucket, decoder, watched, filter_wallets_enabled, writer, status_reporter }
    }

    fn cursor_key(&self) -> String {
        format!("{}.cursor", self.node.id)
    }

    /// Subscribes to this node's head subject and processes events until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), FetcherError> {
        let mut stream = self.subscriber.subscribe(&self.subject).await?;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                event = futures::StreamExt::next(&mut stream) => {
                    match event {
                        Some(event) => self.process_head(event).await,
                        None => {
                            warn!(target: "ekko_supervisor::fetcher", node_id = %self.node.id, "head subscription ended");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn process_head(&self, head: NewHeadEvent) {
        let cursor = self.load_cursor().await;
        if let Some(cursor) = &cursor {
            if cursor.block_number >= head.block_number {
                debug!(target: "ekko_supervisor::fetcher", node_id = %self.node.id, block = head.block_number, "already processed, skipping");
                return;
            }
        }

        let block = match self.fetch_block_with_retry(&head.block_hash).await {
            Ok(block) => block,
            Err(err) => {
                error!(target: "ekko_supervisor::fetcher", node_id = %self.node.id, block = head.block_number, %err, "rpc retries exhausted, skipping block");
                (self.status_reporter)(&self.node.id, NodeStatus::Error(err.to_string()));
                return;
            }
        };

        for tx in &block.transactions {
            let decoded_call = self.decoder.decode(&tx.input).await;

            if self.filter_wallets_enabled {
                let from_watched = self.watched.is_watched(&tx.from).await;
                let to_watched = match &tx.to {
                    Some(to) => self.watched.is_watched(to).await,
                    None => false,
                };
                if !from_watched && !to_watched {
                    continue;
                }
            }

            let record = TransactionRecord {
                block_hash: block.hash.clone(),
                block_number: block.number,
                tx_hash: tx.hash.clone(),
                from: tx.from.clone(),
                to: tx.to.clone(),
                value: tx.value,
                gas: tx.gas,
                decoded_call,
                network: self.node.network.clone(),
                subnet: self.node.subnet.clone(),
                vm_type: self.node.vm_type.as_str().to_owned(),
                node_id: self.node.id.clone(),
            };

            self.writer.enqueue(record).await;
        }

        if let Err(err) = self.advance_cursor(&block).await {
            error!(target: "ekko_supervisor::fetcher", node_id = %self.node.id, %err, "failed to advance cursor");
        }
    }

    async fn load_cursor(&self) -> Option<Cursor> {
        match self.cursor_bucket.get(&self.cursor_key()).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(target: "ekko_supervisor::fetcher", node_id = %self.node.id, %err, "failed to read cursor, assuming none");
                None
            }
        }
    }

    async fn advance_cursor(&self, block: &FetchedBlock) -> Result<(), FetcherError> {
        let cursor = Cursor { block_hash: block.hash.clone(), block_number: block.number };
        let bytes = serde_json::to_vec(&cursor).map_err(|err| FetcherError::Rpc(err.to_string()))?;
        self.cursor_bucket.put(&self.cursor_key(), bytes).await?;
        Ok(())
    }

    async fn fetch_block_with_retry(&self, block_hash: &str) -> Result<FetchedBlock, FetcherError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(RPC_TIMEOUT, self.rpc.get_block_by_hash(block_hash)).await {
                Ok(Ok(block)) => return Ok(block),
                Ok(Err(err)) if attempt < MAX_RPC_ATTEMPTS => {
                    warn!(target: "ekko_supervisor::fetcher", node_id = %self.node.id, attempt, %err, "rpc call failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(200 * 2u64.pow(attempt))).await;
                }
                Ok(Err(err)) => return Err(err),
                Err(_) if attempt < MAX_RPC_ATTEMPTS => {
                    warn!(target: "ekko_supervisor::fetcher", node_id = %self.node.id, attempt, "rpc call timed out, retrying");
                }
                Err(_) => return Err(FetcherError::Rpc("rpc call timed out".into())),
            }
        }
    }
}

impl core::fmt::Debug for BlockFetcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockFetcher").field("node_id", &self.node.id).finish()
    }
}

/// Builds a [`BlockFetcher`] for a newly-enabled node. Mirrors `PipelineSupervisor`'s
/// `NewManagedPipelineFunc` factory indirection (§4.2) for the same test-substitution
/// reason — production wires [`AlloyBlockRpcClient`]; tests wire a scripted stand-in.
pub type BlockFetcherFactory = Arc<dyn Fn(&NodeConfig) -> Arc<BlockFetcher> + Send + Sync>;

struct RunningFetcher {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Maintains one [`BlockFetcher`] per enabled node, keyed by nodeID (§4.5). Structurally
/// a sibling of `PipelineSupervisor`: same guarded-map, lock-release-before-wait
/// discipline, periodic-tick safety net.
pub struct FetcherSupervisor {
    fetchers: Mutex<HashMap<String, RunningFetcher>>,
    factory: BlockFetcherFactory,
    cancel: CancellationToken,
}

impl FetcherSupervisor {
    /// Builds a supervisor bound to `cancel` (the process-level token); every fetcher's
    /// own cancellation is a child of this one.
    pub fn new(factory: BlockFetcherFactory, cancel: CancellationToken) -> Self {
        Self { fetchers: Mutex::new(HashMap::new()), factory, cancel }
    }

    /// Runs the reconcile loop until `cancel` fires: a periodic tick calls `synchronize`
    /// against whatever `enabled_nodes` returns, mirroring `PipelineSupervisor`'s merged
    /// watch+tick loop (§4.1).
    pub async fn run<F>(&self, enabled_nodes: F) -> Result<(), FetcherError>
    where
        F: Fn() -> Vec<NodeConfig> + Send + Sync,
    {
        let mut ticker = tokio::time::interval(RECONCILE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.synchronize(enabled_nodes()).await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.stop_all().await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.synchronize(enabled_nodes()).await;
                }
            }
        }
    }

    /// Reconciles the running fetcher set against `enabled_nodes`: stops fetchers whose
    /// ids are absent, starts fetchers for new ids, leaves unchanged fetchers untouched.
    pub async fn synchronize(&self, enabled_nodes: Vec<NodeConfig>) {
        let desired: HashMap<String, NodeConfig> = enabled_nodes.into_iter().map(|node| (node.id.clone(), node)).collect();

        let stale: Vec<String> = {
            let fetchers = self.fetchers.lock().await;
            fetchers.keys().filter(|id| !desired.contains_key(*id)).cloned().collect()
        };

        for id in stale {
            let running = {
                let mut fetchers = self.fetchers.lock().await;
                fetchers.remove(&id)
            };
            if let Some(running) = running {
                running.cancel.cancel();
                let _ = running.handle.await;
            }
        }

        let missing: Vec<NodeConfig> = {
            let fetchers = self.fetchers.lock().await;
            desired.into_values().filter(|node| !fetchers.contains_key(&node.id)).collect()
        };

        for node in missing {
            let id = node.id.clone();
            let fetcher = (self.factory)(&node);
            let child_cancel = self.cancel.child_token();
            let task_cancel = child_cancel.clone();
            let handle = tokio::spawn(async move {
                if let Err(err) = fetcher.run(task_cancel).await {
                    error!(target: "ekko_supervisor::fetcher", node_id = %id, %err, "fetcher exited with error");
                }
            });
            let mut fetchers = self.fetchers.lock().await;
            fetchers.insert(node.id.clone(), RunningFetcher { cancel: child_cancel, handle });
            info!(target: "ekko_supervisor::fetcher", node_id = %node.id, "started block fetcher");
        }
    }

    async fn stop_all(&self) {
        let running: Vec<RunningFetcher> = {
            let mut fetchers = self.fetchers.lock().await;
            fetchers.drain().map(|(_, running)| running).collect()
        };
        for running in running {
            running.cancel.cancel();
            let _ = running.handle.await;
        }
    }
}

impl core::fmt::Debug for FetcherSupervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FetcherSupervisor").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use chrono::Utc;
    use ekko_supervisor_types::VmType;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn node(id: &str) -> NodeConfig {
        NodeConfig {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            network: "ethereum".into(),
            subnet: "mainnet".into(),
            vm_type: VmType::Evm,
            http_url: "http://localhost:8545".into(),
            wss_url: "ws://localhost:8546".into(),
            is_enabled: true,
            status: NodeStatus::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[derive(Debug, Default)]
    struct InMemoryDataBucket {
        values: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl DataBucket for InMemoryDataBucket {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, crate::error::KvError> {
            Ok(self.values.lock().await.get(key).cloned())
        }
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), crate::error::KvError> {
            self.values.lock().await.insert(key.to_owned(), value);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), BusError> {
            self.published.lock().await.push((subject, payload));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct ScriptedRpcClient {
        calls: AtomicU64,
    }

    #[async_trait]
    impl BlockRpcClient for ScriptedRpcClient {
        async fn get_block_by_hash(&self, block_hash: &str) -> Result<FetchedBlock, FetcherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedBlock {
                hash: block_hash.to_owned(),
                number: 1,
                transactions: vec![FetchedTransaction {
                    hash: "0xtx1".into(),
                    from: "0xfrom".into(),
                    to: Some("0xto".into()),
                    value: 1,
                    gas: 21_000,
                    input: vec![],
                }],
            })
        }
    }

    #[derive(Debug)]
    struct OneShotSubscriber(Mutex<Option<NewHeadEvent>>);

    #[async_trait]
    impl HeadSubscriber for OneShotSubscriber {
        async fn subscribe(&self, _subject: &str) -> Result<BoxStream<'static, NewHeadEvent>, FetcherError> {
            let event = self.0.lock().await.take();
            Ok(Box::pin(futures::stream::iter(event)))
        }
    }

    fn writer_config() -> crate::writer::WriterConfig {
        crate::writer::WriterConfig {
            batch_size: 25,
            flush_interval: std::time::Duration::from_secs(10),
            base_path: "data".into(),
            subject: None,
            network: "ethereum".into(),
            subnet: "mainnet".into(),
            vm_type: "evm".into(),
            node_id: "n1".into(),
        }
    }

    #[tokio::test]
    async fn processes_head_and_advances_cursor() {
        let store: Arc<dyn object_store::ObjectStore> = Arc::new(InMemory::new());
        let bus: Arc<dyn MessageBus> = Arc::new(RecordingBus::default());
        let writer: Arc<ArrowWriter<dyn MessageBus>> = Arc::new(ArrowWriter::new(writer_config(), store, bus));
        let cursor_bucket: Arc<dyn DataBucket> = Arc::new(InMemoryDataBucket::default());
        let rpc = Arc::new(ScriptedRpcClient { calls: AtomicU64::new(0) });

        let fetcher = Arc::new(BlockFetcher::new(
            node("n1"),
            Arc::new(OneShotSubscriber(Mutex::new(Some(NewHeadEvent {
                block_hash: "0xblock1".into(),
                block_number: 1,
                parent_hash: "0xblock0".into(),
                timestamp: Utc::now(),
                node_id: "n1".into(),
            })))),
            rpc.clone(),
            cursor_bucket.clone(),
            Arc::new(NoopDecoder),
            Arc::new(AllowAllAddresses),
            false,
            writer,
            Arc::new(|_, _| {}),
        ));

        fetcher.clone().run(CancellationToken::new()).await.unwrap();

        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
        let cursor_bytes = cursor_bucket.get("n1.cursor").await.unwrap().unwrap();
        let cursor: Cursor = serde_json::from_slice(&cursor_bytes).unwrap();
        assert_eq!(cursor.block_number, 1);
    }

    #[tokio::test]
    async fn synchronize_starts_and_stops_fetchers() {
        let cancel = CancellationToken::new();
        let factory: BlockFetcherFactory = Arc::new(|node| {
            let store: Arc<dyn object_store::ObjectStore> = Arc::new(InMemory::new());
            let bus: Arc<dyn MessageBus> = Arc::new(RecordingBus::default());
            let writer: Arc<ArrowWriter<dyn MessageBus>> = Arc::new(ArrowWriter::new(writer_config(), store, bus));
            Arc::new(BlockFetcher::new(
                node.clone(),
                Arc::new(OneShotSubscriber(Mutex::new(None))),
                Arc::new(ScriptedRpcClient { calls: AtomicU64::new(0) }),
                Arc::new(InMemoryDataBucket::default()),
                Arc::new(NoopDecoder),
                Arc::new(AllowAllAddresses),
                true,
                writer,
                Arc::new(|_, _| {}),
            ))
        });

        let supervisor = FetcherSupervisor::new(factory, cancel.clone());
        supervisor.synchronize(vec![node("n1")]).await;
        assert_eq!(supervisor.fetchers.lock().await.len(), 1);

        supervisor.synchronize(vec![]).await;
        assert_eq!(supervisor.fetchers.lock().await.len(), 0);
    }

    mockall::mock! {
        #[derive(Debug)]
        pub Rpc {}

        #[async_trait]
        impl BlockRpcClient for Rpc {
            async fn get_block_by_hash(&self, block_hash: &str) -> Result<FetchedBlock, FetcherError>;
        }
    }

    /// §4.6/§7 (RPC policy): a block fetch that fails twice then succeeds is retried
    /// in-place rather than skipped, and the successful attempt's block is the one handed
    /// onward.
    #[tokio::test]
    async fn fetch_block_with_retry_recovers_after_transient_failures() {
        let mut rpc = MockRpc::new();
        let mut seq = mockall::Sequence::new();
        rpc.expect_get_block_by_hash()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(FetcherError::Rpc("connection reset".into())));
        rpc.expect_get_block_by_hash().times(1).in_sequence(&mut seq).returning(|hash| {
            Ok(FetchedBlock { hash: hash.to_owned(), number: 7, transactions: vec![] })
        });

        let store: Arc<dyn object_store::ObjectStore> = Arc::new(InMemory::new());
        let bus: Arc<dyn MessageBus> = Arc::new(RecordingBus::default());
        let writer: Arc<ArrowWriter<dyn MessageBus>> = Arc::new(ArrowWriter::new(writer_config(), store, bus));

        let fetcher = BlockFetcher::new(
            node("n1"),
            Arc::new(OneShotSubscriber(Mutex::new(None))),
            Arc::new(rpc),
            Arc::new(InMemoryDataBucket::default()),
            Arc::new(NoopDecoder),
            Arc::new(AllowAllAddresses),
            false,
            writer,
            Arc::new(|_, _| {}),
        );

        let block = fetcher.fetch_block_with_retry("0xblock7").await.unwrap();
        assert_eq!(block.number, 7);
    }

    /// Exhausting all retries surfaces the last error rather than retrying forever.
    #[tokio::test]
    async fn fetch_block_with_retry_gives_up_after_max_attempts() {
        let mut rpc = MockRpc::new();
        rpc.expect_get_block_by_hash()
            .times(3)
            .returning(|_| Err(FetcherError::Rpc("node unreachable".into())));

        let store: Arc<dyn object_store::ObjectStore> = Arc::new(InMemory::new());
        let bus: Arc<dyn MessageBus> = Arc::new(RecordingBus::default());
        let writer: Arc<ArrowWriter<dyn MessageBus>> = Arc::new(ArrowWriter::new(writer_config(), store, bus));

        let fetcher = BlockFetcher::new(
            node("n1"),
            Arc::new(OneShotSubscriber(Mutex::new(None))),
            Arc::new(rpc),
            Arc::new(InMemoryDataBucket::default()),
            Arc::new(NoopDecoder),
            Arc::new(AllowAllAddresses),
            false,
            writer,
            Arc::new(|_, _| {}),
        );

        let err = fetcher.fetch_block_with_retry("0xblock1").await.unwrap_err();
        assert!(matches!(err, FetcherError::Rpc(_)));
    }
}
