//! Config and data key-value buckets.
//!
//! The config bucket (`ekko_nodes` by default) stores `nodestore.<id>` -> `NodeConfig`
//! JSON and must support a prefix watch so [`PipelineSupervisor`](crate::supervisor::PipelineSupervisor)
//! can react to operator edits without polling. The data bucket is unstructured per-fetcher
//! cursor storage, namespaced by key prefix rather than by a separate bucket per node.

use std::sync::Arc;

use async_nats::jetstream::{
    self,
    kv::{Config as KvConfig, Store},
};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{error, warn};

use crate::error::KvError;

/// An entry observed from a bucket watch: the raw key and, if the entry was a put rather
/// than a delete, its value.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    /// The full key, e.g. `nodestore.n1`.
    pub key: String,
    /// `None` when the watch observed a delete.
    pub value: Option<Vec<u8>>,
}

/// A key-value bucket supporting the operations `PipelineSupervisor` needs against the
/// config store: list-by-prefix, get, put, and watch-all.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait ConfigBucket: Send + Sync + core::fmt::Debug {
    /// Lists every key currently stored under `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Fetches the raw value for `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Writes `value` for `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Subscribes to every put/delete under `prefix`, as an unbounded stream of
    /// [`WatchEvent`]s. The stream ends only when the underlying connection drops.
    async fn watch_all(
        &self,
        prefix: &str,
    ) -> Result<futures::stream::BoxStream<'static, WatchEvent>, KvError>;
}

/// A key-value bucket used for per-fetcher cursor state, namespaced by nodeID prefix.
/// Narrower than [`ConfigBucket`]: fetchers never need to watch or list.
#[async_trait]
#[auto_impl::auto_impl(&, Arc)]
pub trait DataBucket: Send + Sync + core::fmt::Debug {
    /// Fetches the raw value for `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Writes `value` for `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;
}

/// A JetStream key-value bucket, usable as either a [`ConfigBucket`] or a [`DataBucket`].
#[derive(Debug, Clone)]
pub struct NatsKvBucket {
    store: Arc<Store>,
}

impl NatsKvBucket {
    /// Opens (creating if absent) the named bucket on `jetstream`.
    pub async fn open(jetstream: &jetstream::Context, bucket: &str) -> Result<Self, KvError> {
        let store = match jetstream.get_key_value(bucket).await {
            Ok(store) => store,
            Err(err) => {
                warn!(target: "ekko_supervisor::kv", bucket, %err, "bucket not found, creating");
                jetstream
                    .create_key_value(KvConfig { bucket: bucket.to_owned(), ..Default::default() })
                    .await
                    .map_err(|err| KvError::Unavailable(err.to_string()))?
            }
        };
        Ok(Self { store: Arc::new(store) })
    }
}

#[async_trait]
impl ConfigBucket for NatsKvBucket {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        ekko_supervisor_metrics::observe_metrics_for_result_async!(
            "ekko_supervisor_kv_success_total",
            "ekko_supervisor_kv_error_total",
            "ekko_supervisor_kv_duration_seconds",
            "list_keys",
            async {
                let mut keys = self
                    .store
                    .keys()
                    .await
                    .map_err(|err| KvError::Operation(err.to_string()))?;
                let mut matched = Vec::new();
                while let Some(key) = keys.next().await {
                    let key = key.map_err(|err| KvError::Operation(err.to_string()))?;
                    if key.starts_with(prefix) {
                        matched.push(key);
                    }
                }
                Ok(matched)
            }
        )
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        ekko_supervisor_metrics::observe_metrics_for_result_async!(
            "ekko_supervisor_kv_success_total",
            "ekko_supervisor_kv_error_total",
            "ekko_supervisor_kv_duration_seconds",
            "get",
            async {
                self.store
                    .get(key)
                    .await
                    .map(|entry| entry.map(|bytes| bytes.to_vec()))
                    .map_err(|err| KvError::Operation(err.to_string()))
            }
        )
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        ekko_supervisor_metrics::observe_metrics_for_result_async!(
            "ekko_supervisor_kv_success_total",
            "ekko_supervisor_kv_error_total",
            "ekko_supervisor_kv_duration_seconds",
            "put",
            async {
                self.store
                    .put(key, value.into())
                    .await
                    .map(|_revision| ())
                    .map_err(|err| KvError::Operation(err.to_string()))
            }
        )
    }

    async fn watch_all(
        &self,
        prefix: &str,
    ) -> Result<futures::stream::BoxStream<'static, WatchEvent>, KvError> {
        let watch_key = format!("{prefix}>");
        let watcher = self
            .store
            .watch_all_from_revision(watch_key, 0)
            .await
            .map_err(|err| KvError::Watch(err.to_string()))?;

        let stream = watcher.filter_map(|entry| async move {
            match entry {
                Ok(entry) => Some(WatchEvent {
                    key: entry.key,
                    value: (entry.operation == jetstream::kv::Operation::Put)
                        .then(|| entry.value.to_vec()),
                }),
                Err(err) => {
                    error!(target: "ekko_supervisor::kv", %err, "watch stream error");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl DataBucket for NatsKvBucket {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        ConfigBucket::get(self, key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        ConfigBucket::put(self, key, value).await
    }
}
