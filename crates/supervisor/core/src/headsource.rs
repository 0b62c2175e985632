//! [`HeadSource`]: the upstream subscription abstraction a `ManagedPipeline` drives.
//!
//! The production implementation, [`WsHeadSource`], wraps a WebSocket `newHeads`
//! subscription with an HTTP-RPC fallback for any head metadata the subscription payload
//! omits. [`ScriptedHeadSource`] is the test double substituted in pipeline tests so a
//! scripted sequence of events (and simulated drops) can be driven without a real node.

use std::sync::Arc;

use alloy_network::Ethereum;
use alloy_provider::{Provider, ProviderBuilder};
use async_trait::async_trait;
use ekko_supervisor_types::NewHeadEvent;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::HeadSourceError;

/// Wall-clock budget for a `HeadSource::start` handshake, per §5.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Channel depth between a `HeadSource`'s connection task and its `out()` receiver.
const CHANNEL_CAPACITY: usize = 256;

/// A substitutable upstream subscription: start, output channel, endpoint hot-swap, close.
///
/// `update_endpoints` only marks the source for reinitialization; it does not itself
/// reconnect. The caller (`ManagedPipeline`) orchestrates close -> update_endpoints -> start.
#[async_trait]
pub trait HeadSource: Send + Sync + core::fmt::Debug {
    /// Begins emitting head events on the channel returned by [`Self::out`]. May suspend
    /// during the connection handshake, bounded by a 15s connect timeout.
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), HeadSourceError>;

    /// Returns the receiving end of this source's output channel. The channel closes when
    /// the source terminates (cancellation, `close`, or an unrecoverable connection error).
    /// Each call to `start` creates a fresh channel; only the receiver from the most recent
    /// `start` is live.
    fn out(&mut self) -> mpsc::Receiver<NewHeadEvent>;

    /// Tears down the current subscription and records new endpoints for the next `start`.
    async fn update_endpoints(&mut self, wss_url: String, http_url: String);

    /// Idempotent: releases network resources, safe to call even if never started.
    async fn close(&mut self);
}

/// Production [`HeadSource`]: a WebSocket `newHeads` subscription with HTTP-RPC fallback.
#[derive(Debug)]
pub struct WsHeadSource {
    wss_url: String,
    http_url: String,
    receiver: Option<mpsc::Receiver<NewHeadEvent>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WsHeadSource {
    /// Creates a source pointed at the given endpoints; does not connect until `start`.
    pub fn new(wss_url: String, http_url: String) -> Self {
        Self { wss_url, http_url, receiver: None, task: None }
    }
}

#[async_trait]
impl HeadSource for WsHeadSource {
    async fn start(&mut self, cancel: CancellationToken) -> Result<(), HeadSourceError> {
        self.close().await;

        let provider = tokio::time::timeout(
            CONNECT_TIMEOUT,
            ProviderBuilder::new().connect(&self.wss_url),
        )
        .await
        .map_err(|_| HeadSourceError::Start("connect timed out".into()))?
        .map_err(|err| HeadSourceError::Start(err.to_string()))?;

        let http_url = self.http_url.clone();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.receiver = Some(rx);

        self.task = Some(tokio::spawn(run_subscription(provider, http_url, tx, cancel)));
        Ok(())
    }

    fn out(&mut self) -> mpsc::Receiver<NewHeadEvent> {
        self.receiver.take().unwrap_or_else(|| mpsc::channel(1).1)
    }

    async fn update_endpoints(&mut self, wss_url: String, http_url: String) {
        self.wss_url = wss_url;
        self.http_url = http_url;
    }

    async fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.receiver = None;
    }
}

async fn run_subscription(
    provider: impl Provider<Ethereum>,
    http_url: String,
    tx: mpsc::Sender<NewHeadEvent>,
    cancel: CancellationToken,
) {
    let subscription = match provider.subscribe_blocks().await {
        Ok(subscription) => subscription,
        Err(err) => {
            error!(target: "ekko_supervisor::headsource", %err, "failed to subscribe to new heads");
            return;
        }
    };
    let mut stream = subscription.into_stream();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(target: "ekko_supervisor::headsource", "cancelled, closing subscription");
                return;
            }
            header = stream.next() => {
                let Some(header) = header else {
                    warn!(target: "ekko_supervisor::headsource", "subscription stream ended");
                    return;
                };
                let event = resolve_event(&http_url, header).await;
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn resolve_event(
    http_url: &str,
    header: alloy_rpc_types_eth::Header,
) -> NewHeadEvent {
    let mut event = NewHeadEvent {
        block_hash: header.hash.to_string(),
        block_number: header.number,
        parent_hash: header.parent_hash.to_string(),
        timestamp: chrono::DateTime::from_timestamp(header.timestamp as i64, 0)
            .unwrap_or_else(chrono::Utc::now),
        node_id: String::new(),
    };

    if event.parent_hash == alloy_primitives::B256::ZERO.to_string() && header.number > 0 {
        if let Ok(fallback) = fetch_header_via_http(http_url, header.hash).await {
            event.parent_hash = fallback.parent_hash.to_string();
        }
    }

    event
}

async fn fetch_header_via_http(
    http_url: &str,
    block_hash: alloy_primitives::B256,
) -> Result<alloy_rpc_types_eth::Header, HeadSourceError> {
    let provider = ProviderBuilder::new()
        .connect(http_url)
        .await
        .map_err(|err| HeadSourceError::Start(err.to_string()))?;
    let block = provider
        .get_block_by_hash(block_hash)
        .await
        .map_err(|err| HeadSourceError::Start(err.to_string()))?
        .ok_or_else(|| HeadSourceError::Start("block not found via http fallback".into()))?;
    Ok(block.header)
}

/// A scripted [`HeadSource`] test double: feeds a pre-recorded sequence of events (or
/// none, simulating a start failure) instead of talking to a real node.
#[derive(Debug, Clone)]
pub struct ScriptedHeadSource {
    events: Arc<Mutex<Vec<NewHeadEvent>>>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<NewHeadEvent>>>>,
    fail_start: bool,
}

impl ScriptedHeadSource {
    /// Builds a scripted source that emits `events` in order once started.
    pub fn new(events: Vec<NewHeadEvent>) -> Self {
        Self { events: Arc::new(Mutex::new(events)), receiver: Arc::new(Mutex::new(None)), fail_start: false }
    }

    /// Builds a scripted source whose `start` always fails, for exercising `SourceStart`
    /// error handling in pipeline tests.
    pub fn failing() -> Self {
        Self { events: Arc::new(Mutex::new(Vec::new())), receiver: Arc::new(Mutex::new(None)), fail_start: true }
    }
}

#[async_trait]
impl HeadSource for ScriptedHeadSource {
    async fn start(&mut self, _cancel: CancellationToken) -> Result<(), HeadSourceError> {
        if self.fail_start {
            return Err(HeadSourceError::Start("scripted failure".into()));
        }

        let events = self.events.lock().await.clone();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.send(event).await;
        }
        *self.receiver.lock().await = Some(rx);
        Ok(())
    }

    fn out(&mut self) -> mpsc::Receiver<NewHeadEvent> {
        self.receiver.try_lock().ok().and_then(|mut guard| guard.take()).unwrap_or_else(|| mpsc::channel(1).1)
    }

    async fn update_endpoints(&mut self, _wss_url: String, _http_url: String) {}

    async fn close(&mut self) {
        *self.receiver.lock().await = None;
    }
}
