//! # Queue Transport
//!
//! Contract for the at-least-once delivery queue the processor consumes:
//! batch receive with an invisibility window, explicit delete to
//! acknowledge, delayed publish for requeues, and visibility extension as
//! the loss-proof fallback. The production transport drives pgmq through
//! its SQL functions; the in-memory transport backs the tests.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Opaque handle identifying one delivery for delete/extend calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt(pub i64);

/// One message pulled off the queue
#[derive(Debug, Clone)]
pub struct QueueDelivery {
    pub receipt: DeliveryReceipt,
    pub body: Value,
    /// Times this message has been delivered, as counted by the transport
    pub receive_count: u32,
}

/// Queue contract per the transport: explicit delete acknowledges, publish
/// accepts a delay clamped to `max_delay_secs`, and visibility of an
/// in-flight message can be extended instead of deleting it.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn receive(&self, max_messages: i32, visibility_secs: u32) -> Result<Vec<QueueDelivery>>;

    async fn delete(&self, receipt: &DeliveryReceipt) -> Result<()>;

    /// Publish a new message with a delivery delay; returns the message id.
    async fn publish(&self, body: &Value, delay_secs: u32) -> Result<i64>;

    async fn extend_visibility(&self, receipt: &DeliveryReceipt, visibility_secs: u32)
        -> Result<()>;

    /// Transport maximum publish delay, seconds.
    fn max_delay_secs(&self) -> u32 {
        900
    }
}

/// pgmq-backed transport over a shared Postgres pool
#[derive(Debug, Clone)]
pub struct PgmqQueue {
    pool: PgPool,
    queue_name: String,
    max_delay_secs: u32,
}

impl PgmqQueue {
    pub fn new(pool: PgPool, queue_name: impl Into<String>, max_delay_secs: u32) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            max_delay_secs,
        }
    }

    /// Create the queue when it does not exist yet.
    pub async fn ensure_queue(&self) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1::text)")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::queue("create", e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for PgmqQueue {
    async fn receive(&self, max_messages: i32, visibility_secs: u32) -> Result<Vec<QueueDelivery>> {
        let rows = sqlx::query(
            "SELECT msg_id, read_ct, message FROM pgmq.read($1::text, $2::integer, $3::integer)",
        )
        .bind(&self.queue_name)
        .bind(visibility_secs as i32)
        .bind(max_messages)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PipelineError::queue("receive", e.to_string()))?;

        let deliveries = rows
            .into_iter()
            .map(|row| QueueDelivery {
                receipt: DeliveryReceipt(row.get::<i64, _>("msg_id")),
                body: row.get::<Value, _>("message"),
                receive_count: row.get::<i32, _>("read_ct").max(0) as u32,
            })
            .collect::<Vec<_>>();

        debug!(queue = %self.queue_name, count = deliveries.len(), "received batch");
        Ok(deliveries)
    }

    async fn delete(&self, receipt: &DeliveryReceipt) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1::text, $2::bigint)")
            .bind(&self.queue_name)
            .bind(receipt.0)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::queue("delete", e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, body: &Value, delay_secs: u32) -> Result<i64> {
        let delay = delay_secs.min(self.max_delay_secs);
        let msg_id: i64 =
            sqlx::query_scalar("SELECT pgmq.send($1::text, $2::jsonb, $3::integer)")
                .bind(&self.queue_name)
                .bind(body)
                .bind(delay as i32)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PipelineError::queue("publish", e.to_string()))?;
        debug!(queue = %self.queue_name, msg_id, delay_secs = delay, "published message");
        Ok(msg_id)
    }

    async fn extend_visibility(
        &self,
        receipt: &DeliveryReceipt,
        visibility_secs: u32,
    ) -> Result<()> {
        sqlx::query("SELECT pgmq.set_vt($1::text, $2::bigint, $3::integer)")
            .bind(&self.queue_name)
            .bind(receipt.0)
            .bind(visibility_secs as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| PipelineError::queue("extend_visibility", e.to_string()))?;
        Ok(())
    }

    fn max_delay_secs(&self) -> u32 {
        self.max_delay_secs
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    msg_id: i64,
    body: Value,
    visible_at: Instant,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    next_id: i64,
    messages: Vec<StoredMessage>,
    publish_failures: usize,
}

/// In-memory transport for tests, with controllable publish failures so the
/// visibility-extension fallback can be exercised.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<MemoryQueueState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publish calls fail.
    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.publish_failures = count;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.messages.is_empty()
    }

    /// Body of the first stored message regardless of visibility. Test hook.
    pub async fn peek_body(&self) -> Option<Value> {
        self.state
            .lock()
            .await
            .messages
            .first()
            .map(|m| m.body.clone())
    }

    /// Visibility deadline of a message, for asserting extensions. Test hook.
    pub async fn visible_at(&self, msg_id: i64) -> Option<Instant> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .find(|m| m.msg_id == msg_id)
            .map(|m| m.visible_at)
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn receive(&self, max_messages: i32, visibility_secs: u32) -> Result<Vec<QueueDelivery>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut out = Vec::new();
        for message in state.messages.iter_mut() {
            if out.len() >= max_messages.max(0) as usize {
                break;
            }
            if message.visible_at <= now {
                message.visible_at = now + Duration::from_secs(visibility_secs as u64);
                message.receive_count += 1;
                out.push(QueueDelivery {
                    receipt: DeliveryReceipt(message.msg_id),
                    body: message.body.clone(),
                    receive_count: message.receive_count,
                });
            }
        }
        Ok(out)
    }

    async fn delete(&self, receipt: &DeliveryReceipt) -> Result<()> {
        let mut state = self.state.lock().await;
        state.messages.retain(|m| m.msg_id != receipt.0);
        Ok(())
    }

    async fn publish(&self, body: &Value, delay_secs: u32) -> Result<i64> {
        let mut state = self.state.lock().await;
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(PipelineError::queue("publish", "simulated publish failure"));
        }
        state.next_id += 1;
        let msg_id = state.next_id;
        let delay = delay_secs.min(self.max_delay_secs());
        state.messages.push(StoredMessage {
            msg_id,
            body: body.clone(),
            visible_at: Instant::now() + Duration::from_secs(delay as u64),
            receive_count: 0,
        });
        Ok(msg_id)
    }

    async fn extend_visibility(
        &self,
        receipt: &DeliveryReceipt,
        visibility_secs: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.msg_id == receipt.0)
            .ok_or_else(|| PipelineError::queue("extend_visibility", "unknown receipt"))?;
        message.visible_at = Instant::now() + Duration::from_secs(visibility_secs as u64);
        Ok(())
    }
}
