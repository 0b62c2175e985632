//! [`ArrowWriter`]: batches [`TransactionRecord`]s into columnar files and uploads them
//! to object storage, publishing a manifest event after each successful flush.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arrow_array::{RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use chrono::Utc;
use ekko_supervisor_types::TransactionRecord;
use object_store::{path::Path as ObjectPath, ObjectStore, PutPayload};
use parquet::arrow::ArrowWriter as ParquetArrowWriter;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{bus::MessageBus, error::WriterError};

/// Maximum upload attempts for a single flush before the batch is dropped with a loud log.
const MAX_UPLOAD_ATTEMPTS: u32 = 3;

/// Configuration for one [`ArrowWriter`], matching §4.7's recognized options.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum records per file. Default 25.
    pub batch_size: usize,
    /// Maximum wall time between flushes. Default 10s.
    pub flush_interval: std::time::Duration,
    /// Prefix under the object store bucket, before the `<network>/<subnet>/<vmType>/<nodeID>` path.
    pub base_path: String,
    /// Bus subject to publish a manifest event on after each flush. Defaults to
    /// `ekko.<network>.<subnet>.<vmType>.persistence` if left unset.
    pub subject: Option<String>,
    /// Group this writer's records belong to.
    pub network: String,
    pub subnet: String,
    pub vm_type: String,
    /// Id of the node these records are sourced from; part of the object key to avoid
    /// cross-writer key collisions (§5 shared-resource policy).
    pub node_id: String,
}

impl WriterConfig {
    /// Default batch size (§4.7).
    pub const DEFAULT_BATCH_SIZE: usize = 25;
    /// Default flush interval (§4.7).
    pub const DEFAULT_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

    fn subject(&self) -> String {
        self.subject.clone().unwrap_or_else(|| {
            format!("ekko.{}.{}.{}.persistence", self.network, self.subnet, self.vm_type)
        })
    }
}

#[derive(Debug, Serialize)]
struct Manifest {
    object_key: String,
    record_count: usize,
    network: String,
    subnet: String,
    vm_type: String,
    flushed_at: chrono::DateTime<Utc>,
}

/// Batches [`TransactionRecord`]s and periodically flushes them to object storage as
/// Parquet files, one per flush. Owned exclusively by a single `BlockFetcher` (§3).
pub struct ArrowWriter<B: MessageBus> {
    config: WriterConfig,
    buffer: Mutex<Vec<TransactionRecord>>,
    sequence: AtomicU64,
    notify: Notify,
    store: Arc<dyn ObjectStore>,
    bus: Arc<B>,
}

impl<B: MessageBus> ArrowWriter<B> {
    /// Builds a writer for one `(network, subnet, vmType, nodeID)` group.
    pub fn new(config: WriterConfig, store: Arc<dyn ObjectStore>, bus: Arc<B>) -> Self {
        Self { config, buffer: Mutex::new(Vec::new()), sequence: AtomicU64::new(0), notify: Notify::new(), store, bus }
    }

    /// Enqueues a record for the next flush. Never blocks on I/O; triggers an
    /// out-of-band flush once the buffer reaches `batchSize`.
    pub async fn enqueue(&self, record: TransactionRecord) {
        let len = {
            let mut buffer = self.buffer.lock().await;
            buffer.push(record);
            buffer.len()
        };
        if len >= self.config.batch_size {
            self.notify.notify_one();
        }
    }

    /// Runs the flush loop until `cancel` fires, then flushes any partial batch before
    /// returning (§4.7's "must flush any partial batch before returning").
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WriterError> {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.flush_if_nonempty().await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.flush_if_nonempty().await;
                }
                () = self.notify.notified() => {
                    self.flush_if_nonempty().await;
                }
            }
        }
    }

    async fn flush_if_nonempty(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        if let Err(err) = self.flush(&batch).await {
            error!(target: "ekko_supervisor::writer", node_id = %self.config.node_id, %err, "dropping batch after repeated upload failures");
        }
    }

    async fn flush(&self, records: &[TransactionRecord]) -> Result<(), WriterError> {
        ekko_supervisor_metrics::observe_metrics_for_result_async!(
            "ekko_supervisor_writer_success_total",
            "ekko_supervisor_writer_error_total",
            "ekko_supervisor_writer_duration_seconds",
            "flush",
            async {
                let bytes = encode_parquet(records)?;
                let key = self.object_key();

                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match self.store.put(&ObjectPath::from(key.as_str()), PutPayload::from(bytes.clone())).await {
                        Ok(_) => break,
                        Err(err) if attempt < MAX_UPLOAD_ATTEMPTS => {
                            warn!(target: "ekko_supervisor::writer", node_id = %self.config.node_id, attempt, %err, "upload failed, retrying");
                            tokio::time::sleep(std::time::Duration::from_millis(200 * u64::from(attempt))).await;
                        }
                        Err(err) => return Err(WriterError::Upload(err.to_string())),
                    }
                }

                let manifest = Manifest {
                    object_key: key,
                    record_count: records.len(),
                    network: self.config.network.clone(),
                    subnet: self.config.subnet.clone(),
                    vm_type: self.config.vm_type.clone(),
                    flushed_at: Utc::now(),
                };

                match serde_json::to_vec(&manifest) {
                    Ok(payload) => {
                        if let Err(err) = self.bus.publish(self.config.subject(), payload).await {
                            warn!(target: "ekko_supervisor::writer", node_id = %self.config.node_id, %err, "manifest publish failed");
                        }
                    }
                    Err(err) => error!(target: "ekko_supervisor::writer", %err, "failed to serialize manifest"),
                }

                info!(target: "ekko_supervisor::writer", node_id = %self.config.node_id, records = records.len(), "flushed batch");
                Ok(())
            },
            "node_id" => self.config.node_id.as_str()
        )
    }

    fn object_key(&self) -> String {
        let now = Utc::now();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}/{}/{}/{}/{}/{}/{}/{}/{}-{sequence}.parquet",
            self.config.base_path.trim_end_matches('/'),
            self.config.network,
            self.config.subnet,
            self.config.vm_type,
            self.config.node_id,
            now.format("%Y"),
            now.format("%m"),
            now.format("%d"),
            now.format("%H%M%S"),
        )
    }
}

impl<B: MessageBus> core::fmt::Debug for ArrowWriter<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArrowWriter").field("node_id", &self.config.node_id).finish()
    }
}

fn transaction_schema() -> Schema {
    Schema::new(vec![
        Field::new("block_number", DataType::UInt64, false),
        Field::new("block_hash", DataType::Utf8, false),
        Field::new("tx_hash", DataType::Utf8, false),
        Field::new("from", DataType::Utf8, false),
        Field::new("to", DataType::Utf8, true),
        Field::new("value", DataType::Utf8, false),
        Field::new("gas", DataType::UInt64, false),
        Field::new("decoded_function", DataType::Utf8, true),
        Field::new("decoded_params", DataType::Utf8, true),
        Field::new("network", DataType::Utf8, false),
        Field::new("subnet", DataType::Utf8, false),
        Field::new("vm_type", DataType::Utf8, false),
        Field::new("node_id", DataType::Utf8, false),
    ])
}

fn encode_parquet(records: &[TransactionRecord]) -> Result<Vec<u8>, WriterError> {
    let schema = Arc::new(transaction_schema());

    let block_number: UInt64Array = records.iter().map(|r| r.block_number).collect();
    let block_hash: StringArray = records.iter().map(|r| Some(r.block_hash.as_str())).collect();
    let tx_hash: StringArray = records.iter().map(|r| Some(r.tx_hash.as_str())).collect();
    let from: StringArray = records.iter().map(|r| Some(r.from.as_str())).collect();
    let to: StringArray = records.iter().map(|r| r.to.as_deref()).collect();
    let value: StringArray = records.iter().map(|r| Some(r.value.to_string())).collect();
    let gas: UInt64Array = records.iter().map(|r| r.gas).collect();
    let decoded_function: StringArray =
        records.iter().map(|r| r.decoded_call.as_ref().map(|call| call.function.as_str())).collect();
    let decoded_params: StringArray = records
        .iter()
        .map(|r| r.decoded_call.as_ref().map(|call| call.parameters.to_string()))
        .collect();
    let network: StringArray = records.iter().map(|r| Some(r.network.as_str())).collect();
    let subnet: StringArray = records.iter().map(|r| Some(r.subnet.as_str())).collect();
    let vm_type: StringArray = records.iter().map(|r| Some(r.vm_type.as_str())).collect();
    let node_id: StringArray = records.iter().map(|r| Some(r.node_id.as_str())).collect();

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(block_number),
            Arc::new(block_hash),
            Arc::new(tx_hash),
            Arc::new(from),
            Arc::new(to),
            Arc::new(value),
            Arc::new(gas),
            Arc::new(decoded_function),
            Arc::new(decoded_params),
            Arc::new(network),
            Arc::new(subnet),
            Arc::new(vm_type),
            Arc::new(node_id),
        ],
    )
    .map_err(|err| WriterError::Encode(err.to_string()))?;

    let mut buffer = Vec::new();
    let mut writer = ParquetArrowWriter::try_new(&mut buffer, schema, None)
        .map_err(|err| WriterError::Encode(err.to_string()))?;
    writer.write(&batch).map_err(|err| WriterError::Encode(err.to_string()))?;
    writer.close().map_err(|err| WriterError::Encode(err.to_string()))?;

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekko_supervisor_types::DecodedCall;
    use object_store::memory::InMemory;

    fn sample_record(i: u64) -> TransactionRecord {
        TransactionRecord {
            block_hash: format!("0xblock{i}"),
            block_number: i,
            tx_hash: format!("0xtx{i}"),
            from: "0xfrom".into(),
            to: Some("0xto".into()),
            value: 1_000,
            gas: 21_000,
            decoded_call: Some(DecodedCall { function: "transfer".into(), parameters: serde_json::json!({}) }),
            network: "ethereum".into(),
            subnet: "mainnet".into(),
            vm_type: "evm".into(),
            node_id: "n1".into(),
        }
    }

    fn config() -> WriterConfig {
        WriterConfig {
            batch_size: 3,
            flush_interval: std::time::Duration::from_secs(10),
            base_path: "data".into(),
            subject: None,
            network: "ethereum".into(),
            subnet: "mainnet".into(),
            vm_type: "evm".into(),
            node_id: "n1".into(),
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

    #[test]
    fn encodes_records_into_parquet_bytes() {
        let bytes = encode_parquet(&[sample_record(1), sample_record(2)]).unwrap();
        assert!(!bytes.is_empty());
    }

    #[tokio::test]
    async fn flush_uploads_and_publishes_manifest() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let bus = Arc::new(RecordingBus::default());
        let writer = ArrowWriter::new(config(), store.clone(), bus.clone());

        writer.flush(&[sample_record(1)]).await.unwrap();

        let published = bus.published.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "ekko.ethereum.mainnet.evm.persistence");
    }

    #[tokio::test]
    async fn count_trigger_flushes_at_batch_size() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let bus = Arc::new(RecordingBus::default());
        let writer = Arc::new(ArrowWriter::new(config(), store, bus.clone()));

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let writer_clone = writer.clone();
        let handle = tokio::spawn(async move { writer_clone.run(cancel_clone).await });

        for i in 0..3 {
            writer.enqueue(sample_record(i)).await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        let _ = handle.await;

        assert_eq!(bus.published.lock().await.len(), 1);
    }
}
