//! The durable, append-only message bus used for head-event fanout and persistence
//! manifests.

use async_nats::Client as NatsClient;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::BusError;

/// A publish-only capability over the message bus.
///
/// `ManagedPipeline`, `FetcherSupervisor`'s `nodes` fanout tickle, and `ArrowWriter`'s
/// manifest events all only ever publish; nothing in this control plane subscribes to a
/// subject it also owns, so there is no separate `subscribe` method on this trait —
/// `BlockFetcher`'s head-subject subscription is a narrower capability, see
/// [`crate::fetcher`].
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait MessageBus: Send + Sync + core::fmt::Debug {
    /// Publishes `payload` to `subject`. The bus is assumed to durable-buffer; callers
    /// never retry a failed publish themselves.
    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), BusError>;
}

/// A [`MessageBus`] backed by a core NATS connection.
#[derive(Debug, Clone)]
pub struct NatsMessageBus {
    client: NatsClient,
}

impl NatsMessageBus {
    /// Wraps an already-connected NATS client.
    pub fn new(client: NatsClient) -> Self {
        Self { client }
    }

    /// Connects to `url` and wraps the resulting client.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        Ok(Self::new(client))
    }

    /// Borrows the underlying NATS client, e.g. to open a JetStream context for the
    /// config/data key-value buckets.
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject, Bytes::from(payload))
            .await
            .map_err(|err| BusError::Publish(err.to_string()))
    }
}

/// Subscribes to the optional `nodes` fanout subject (§6): any payload published there
/// (by the dashboard or any other operator tool) is treated as a tickle that forces an
/// out-of-cycle reconcile, independent of the config bucket watch. Narrower than
/// [`MessageBus`] (subscribe-only) for the same reason `HeadSubscriber` is split out from
/// it in `fetcher.rs` — nothing that publishes on this control plane also subscribes.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait ReconcileTrigger: Send + Sync + core::fmt::Debug {
    /// Subscribes to `subject`, yielding a unit per message received (the payload itself
    /// carries no information the supervisor consumes — see DESIGN.md's Open Question
    /// decision on this subject's payload shape).
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, ()>, BusError>;
}

#[async_trait]
impl ReconcileTrigger for NatsMessageBus {
    async fn subscribe(&self, subject: &str) -> Result<BoxStream<'static, ()>, BusError> {
        let subscription = self
            .client
            .subscribe(subject.to_owned())
            .await
            .map_err(|err| BusError::Subscribe(err.to_string()))?;
        Ok(Box::pin(futures::StreamExt::map(subscription, |_message| ())))
    }
}
