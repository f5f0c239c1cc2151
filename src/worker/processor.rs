//! # Task Processor
//!
//! Poll loop over the queue: receive a batch, decode each delivery into a
//! typed task, dispatch to the map or reduce executor, and close out the
//! delivery through the ack/requeue protocol. Each delivery is handled
//! independently; one bad or failing message never stalls its batchmates.
//!
//! Malformed payloads are the only deliveries dropped outright. They can
//! never become valid, so requeuing them would just burn attempts.

use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::messaging::queue::{QueueDelivery, QueueTransport};
use crate::messaging::TaskMessage;
use crate::resilience::RetryPolicy;
use crate::worker::map_executor::MapExecutor;
use crate::worker::reduce_executor::ReduceExecutor;
use crate::worker::requeue::{MessageDisposition, RequeueProtocol, RetryBudget};

/// Pause between polls that returned no messages.
const IDLE_POLL_PAUSE: Duration = Duration::from_secs(2);

pub struct TaskProcessor {
    transport: Arc<dyn QueueTransport>,
    requeue: RequeueProtocol,
    map_executor: MapExecutor,
    reduce_executor: ReduceExecutor,
    batch_size: i32,
    visibility_secs: u32,
    overall_timeout: Duration,
}

impl TaskProcessor {
    pub fn new(
        config: &PipelineConfig,
        transport: Arc<dyn QueueTransport>,
        map_executor: MapExecutor,
        reduce_executor: ReduceExecutor,
    ) -> Self {
        let requeue = RequeueProtocol::new(
            transport.clone(),
            RetryPolicy::new(config.backoff.base_secs, config.backoff.cap_secs),
            config.execution.max_attempts,
            config.queue.visibility_secs,
            config.execution.map_retry_delay_secs,
        );
        Self {
            transport,
            requeue,
            map_executor,
            reduce_executor,
            batch_size: config.queue.batch_size,
            visibility_secs: config.queue.visibility_secs,
            overall_timeout: config.overall_timeout(),
        }
    }

    /// Poll until the process is stopped. Transport errors on receive are
    /// logged and retried after the idle pause rather than taking the
    /// worker down.
    pub async fn run(&self) -> Result<()> {
        info!(batch_size = self.batch_size, "task processor started");
        loop {
            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(IDLE_POLL_PAUSE).await,
                Ok(handled) => debug!(handled, "batch complete"),
                Err(e) => {
                    error!(error = %e, "queue receive failed");
                    tokio::time::sleep(IDLE_POLL_PAUSE).await;
                }
            }
        }
    }

    /// Receive one batch and process every delivery in it. Returns the
    /// number of deliveries handled.
    pub async fn poll_once(&self) -> Result<usize> {
        let deliveries = self
            .transport
            .receive(self.batch_size, self.visibility_secs)
            .await?;
        let count = deliveries.len();
        // In delivery order: map results produced earlier in the batch are
        // visible to a reduce task delivered behind them.
        for delivery in deliveries {
            self.handle_delivery(delivery).await;
        }
        Ok(count)
    }

    /// Decode, execute, and settle one delivery. All failure paths end in a
    /// log record plus either a requeue or an explicit drop; nothing is
    /// swallowed.
    async fn handle_delivery(&self, delivery: QueueDelivery) {
        let correlation_id = Uuid::new_v4();
        let message = match TaskMessage::decode(&delivery.body) {
            Ok(message) => message,
            Err(decode_err) => {
                warn!(
                    %correlation_id,
                    receive_count = delivery.receive_count,
                    error = %decode_err,
                    "dropping malformed message"
                );
                if let Err(e) = self.requeue.ack_drop(&delivery.receipt).await {
                    error!(%correlation_id, error = %e, "failed to delete malformed message");
                }
                return;
            }
        };

        info!(
            %correlation_id,
            kind = message.kind_str(),
            task_id = %message.task_id(),
            attempt = message.attempt(),
            receive_count = delivery.receive_count,
            "processing task"
        );

        let budget = RetryBudget::starting_now(self.overall_timeout);
        let outcome = match &message {
            TaskMessage::Map(task) => self.map_executor.execute(task).await,
            TaskMessage::Reduce(task) => self.reduce_executor.execute(task).await,
        };

        let settled = match outcome {
            Ok(()) => self.requeue.ack_success(&delivery.receipt).await,
            Err(cause) if cause.is_terminal_drop() => {
                warn!(%correlation_id, error = %cause, "dropping unprocessable task");
                self.requeue.ack_drop(&delivery.receipt).await
            }
            Err(cause) => {
                self.requeue
                    .requeue_failure(&delivery.receipt, &message, &cause, &budget)
                    .await
            }
        };

        match settled {
            Ok(MessageDisposition::Acked { retry_message_id }) => {
                debug!(%correlation_id, ?retry_message_id, "delivery acknowledged");
            }
            Ok(MessageDisposition::Extended { visibility_secs }) => {
                debug!(%correlation_id, visibility_secs, "delivery visibility extended");
            }
            Err(e) => {
                // The message stays in flight and will resurface when its
                // current visibility window lapses.
                error!(%correlation_id, error = %e, "failed to settle delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::generation::{
        GenerationRequest, GenerationResponse, Generator, ProtectedGenerator,
    };
    use crate::messaging::queue::MemoryQueue;
    use crate::resilience::{CircuitBreaker, TokenBucket};
    use crate::storage::blob::{BlobStore, Locator, MemoryBlobStore};
    use crate::storage::table::MemoryTableStore;
    use crate::storage::writer::RecordWriter;
    use async_trait::async_trait;
    use serde_json::json;

    struct StaticGenerator {
        text: String,
    }

    #[async_trait]
    impl Generator for StaticGenerator {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse> {
            Ok(GenerationResponse {
                text: self.text.clone(),
                raw: serde_json::Value::Null,
            })
        }
    }

    fn build_processor(
        queue: Arc<MemoryQueue>,
        blobs: Arc<MemoryBlobStore>,
        table: Arc<MemoryTableStore>,
        generated: &str,
    ) -> TaskProcessor {
        let config = PipelineConfig::default();
        let generator = Arc::new(ProtectedGenerator::new(
            Arc::new(StaticGenerator {
                text: generated.to_string(),
            }),
            Arc::new(TokenBucket::new(100.0, 100.0)),
            CircuitBreaker::new("generation", config.circuit_breaker.clone()),
            config.call_timeout(),
        ));
        let writer = Arc::new(RecordWriter::new(table, Duration::from_millis(1)));
        TaskProcessor::new(
            &config,
            queue,
            MapExecutor::new(blobs.clone(), generator.clone()),
            ReduceExecutor::new(blobs, generator, writer),
        )
    }

    #[tokio::test]
    async fn test_map_message_processed_and_acked() {
        let queue = Arc::new(MemoryQueue::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let table = Arc::new(MemoryTableStore::new());
        let source = Locator::parse("blob://minutes/chunks/c1.txt").unwrap();
        blobs
            .put(&source, b"text".to_vec(), "text/plain")
            .await
            .unwrap();
        queue
            .publish(
                &json!({
                    "kind": "map",
                    "sourceUri": "blob://minutes/chunks/c1.txt",
                    "resultUri": "blob://minutes/results/c1.json",
                    "generator": "gen",
                    "generatorModel": "gen-1"
                }),
                0,
            )
            .await
            .unwrap();

        let processor = build_processor(queue.clone(), blobs.clone(), table, "{\"summaryPoints\":[]}");
        assert_eq!(processor.poll_once().await.unwrap(), 1);

        assert!(queue.is_empty().await);
        let result = Locator::parse("blob://minutes/results/c1.json").unwrap();
        assert!(blobs.exists(&result).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_message_dropped() {
        let queue = Arc::new(MemoryQueue::new());
        queue
            .publish(&json!({"kind": "map", "sourceUri": ""}), 0)
            .await
            .unwrap();

        let processor = build_processor(
            queue.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryTableStore::new()),
            "{}",
        );
        assert_eq!(processor.poll_once().await.unwrap(), 1);
        // Dropped, not requeued
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_map_requeued_with_higher_attempt() {
        let queue = Arc::new(MemoryQueue::new());
        // No source blob, so the map execution fails
        queue
            .publish(
                &json!({
                    "kind": "map",
                    "sourceUri": "blob://minutes/chunks/absent.txt",
                    "resultUri": "blob://minutes/results/absent.json",
                    "generator": "gen",
                    "generatorModel": "gen-1",
                    "attempt": 1
                }),
                0,
            )
            .await
            .unwrap();

        let processor = build_processor(
            queue.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryTableStore::new()),
            "{}",
        );
        assert_eq!(processor.poll_once().await.unwrap(), 1);

        // Original acked, retry copy pending with attempt bumped
        assert_eq!(queue.len().await, 1);
        let body = queue.peek_body().await.unwrap();
        let retried = TaskMessage::decode(&body).unwrap();
        assert_eq!(retried.attempt(), 2);
    }
}
