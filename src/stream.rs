use crate::store::{KvStore, StoreError, StreamGroupSummary, StreamSummary};
use crate::types::{ConsensusMessage, STREAM_BATCH_SIZE, STREAM_BLOCK_MS, STREAM_POLL_INTERVAL};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

pub const CONSENSUS_STREAM: &str = "consensus_messages";
pub const CONSENSUS_GROUP: &str = "consensus_processors";

const MESSAGE_FIELD: &str = "message";

/// The post-queue entrypoint. Implemented by the replica; kept as a trait so
/// the stream pipeline never imports consensus internals.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    /// Must be idempotent: delivery is at-least-once. A returned error
    /// leaves the message pending for redelivery; Ok consumes it.
    async fn process_queued(
        &self,
        message: ConsensusMessage,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Operational snapshot of the stream and its consumer groups.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamHealth {
    pub stream: StreamSummary,
    pub groups: Vec<StreamGroupSummary>,
}

/// Durable, acknowledged, consumer-grouped queue for consensus messages.
pub struct MessageStream {
    kv: Arc<dyn KvStore>,
}

impl MessageStream {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Idempotent stream + group initialization.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.kv
            .stream_create_group(CONSENSUS_STREAM, CONSENSUS_GROUP)
            .await?;
        self.kv
            .set(&format!("stream-exists:{CONSENSUS_STREAM}"), "true")
            .await?;
        Ok(())
    }

    /// Stream length and per-group pending counts, for the ops surface.
    pub async fn health(&self) -> Result<StreamHealth, StoreError> {
        Ok(StreamHealth {
            stream: self.kv.stream_info(CONSENSUS_STREAM).await?,
            groups: self.kv.stream_groups_info(CONSENSUS_STREAM).await?,
        })
    }

    /// Append a message; returns after the durable write with the
    /// server-assigned id.
    pub async fn enqueue(&self, message: &ConsensusMessage) -> Result<String, StoreError> {
        let payload = serde_json::to_string(message)?;
        self.kv
            .stream_append(CONSENSUS_STREAM, &[(MESSAGE_FIELD, &payload)])
            .await
    }

    /// One consumer worker: blocking group reads, handler dispatch, ACK on
    /// success. At most one batch is in flight per consumer; a failed
    /// handler leaves the entry pending for redelivery.
    pub async fn run_consumer(
        &self,
        consumer_name: &str,
        handler: Arc<dyn QueueHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("Stream consumer {consumer_name} started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                result = self.kv.stream_read_group(
                    CONSENSUS_STREAM,
                    CONSENSUS_GROUP,
                    consumer_name,
                    STREAM_BATCH_SIZE,
                    STREAM_BLOCK_MS,
                ) => match result {
                    Ok(batch) => batch,
                    Err(e) => {
                        log::warn!("Stream read failed for {consumer_name}: {e}");
                        tokio::time::sleep(STREAM_POLL_INTERVAL).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            for entry in batch {
                let Some(raw) = entry
                    .fields
                    .iter()
                    .find(|(k, _)| k == MESSAGE_FIELD)
                    .map(|(_, v)| v.clone())
                else {
                    // Nothing to process; discard so it cannot wedge the
                    // pending list forever.
                    self.ack(&entry.id).await;
                    continue;
                };

                let message: ConsensusMessage = match serde_json::from_str(&raw) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Discarding undecodable stream entry {}: {e}", entry.id);
                        self.ack(&entry.id).await;
                        continue;
                    }
                };

                match handler.process_queued(message).await {
                    Ok(()) => self.ack(&entry.id).await,
                    Err(e) => {
                        log::warn!(
                            "Handler failed for stream entry {}; leaving pending: {e}",
                            entry.id
                        );
                    }
                }
            }

            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
        log::info!("Stream consumer {consumer_name} stopped");
    }

    async fn ack(&self, id: &str) {
        if let Err(e) = self.kv.stream_ack(CONSENSUS_STREAM, CONSENSUS_GROUP, id).await {
            log::warn!("Failed to ack stream entry {id}: {e}");
        }
    }
}
