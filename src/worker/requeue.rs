//! # Queue Ack/Requeue Protocol
//!
//! Terminal handling for every processed message. Success acknowledges;
//! failure republishes a copy with an incremented attempt and a computed
//! delay, then acknowledges the original. When the republish itself fails,
//! the original's visibility window is extended instead, trading a
//! duplicate in-flight window for zero message loss. Downstream effects
//! (blob overwrite by deterministic key, record overwrite by deterministic
//! id) are idempotent, which is what makes the at-least-once model safe.

use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{PipelineError, Result};
use crate::messaging::queue::{DeliveryReceipt, QueueTransport};
use crate::messaging::TaskMessage;
use crate::resilience::RetryPolicy;

/// Final state of one delivery: either the original was removed from the
/// queue, or it was left in place with its visibility extended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDisposition {
    Acked { retry_message_id: Option<i64> },
    Extended { visibility_secs: u32 },
}

/// Overall deadline for one delivery; retries are not scheduled past it.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    deadline: Instant,
}

impl RetryBudget {
    pub fn starting_now(overall: Duration) -> Self {
        Self {
            deadline: Instant::now() + overall,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Clamp a requeue delay so the retry lands before the deadline.
    pub fn clamp_secs(&self, delay_secs: u64) -> u64 {
        delay_secs.min(self.remaining().as_secs())
    }
}

/// Executes the ack/requeue state machine against a queue transport
pub struct RequeueProtocol {
    transport: Arc<dyn QueueTransport>,
    policy: RetryPolicy,
    max_attempts: u32,
    default_visibility_secs: u32,
    map_retry_delay_secs: u32,
}

impl RequeueProtocol {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        policy: RetryPolicy,
        max_attempts: u32,
        default_visibility_secs: u32,
        map_retry_delay_secs: u32,
    ) -> Self {
        Self {
            transport,
            policy,
            max_attempts,
            default_visibility_secs,
            map_retry_delay_secs,
        }
    }

    /// Acknowledge a successfully processed message.
    pub async fn ack_success(&self, receipt: &DeliveryReceipt) -> Result<MessageDisposition> {
        self.transport.delete(receipt).await?;
        Ok(MessageDisposition::Acked {
            retry_message_id: None,
        })
    }

    /// Acknowledge (drop) a message that can never become valid.
    pub async fn ack_drop(&self, receipt: &DeliveryReceipt) -> Result<MessageDisposition> {
        self.transport.delete(receipt).await?;
        Ok(MessageDisposition::Acked {
            retry_message_id: None,
        })
    }

    /// Route a failed execution: republish with incremented attempt and a
    /// delay, then acknowledge the original; fall back to extending the
    /// original's visibility when the republish cannot be completed.
    pub async fn requeue_failure(
        &self,
        receipt: &DeliveryReceipt,
        message: &TaskMessage,
        cause: &PipelineError,
        budget: &RetryBudget,
    ) -> Result<MessageDisposition> {
        let next_attempt = message.attempt() + 1;
        if next_attempt > self.max_attempts {
            // Leave the message to the transport's own redrive policy
            error!(
                task_id = %message.task_id(),
                attempt = message.attempt(),
                max_attempts = self.max_attempts,
                cause = %cause,
                "attempts exhausted, leaving message for transport redrive"
            );
            self.transport
                .extend_visibility(receipt, self.default_visibility_secs)
                .await?;
            return Ok(MessageDisposition::Extended {
                visibility_secs: self.default_visibility_secs,
            });
        }

        let delay_secs = self.select_delay_secs(message, cause, next_attempt, budget);
        let copy = message.next_attempt().encode()?;

        match self.transport.publish(&copy, delay_secs as u32).await {
            Ok(retry_message_id) => {
                info!(
                    task_id = %message.task_id(),
                    attempt = next_attempt,
                    delay_secs,
                    retry_message_id,
                    cause = %cause,
                    "requeued failed task"
                );
                if let Err(delete_err) = self.transport.delete(receipt).await {
                    // The copy is already out; let the original surface
                    // later and rely on idempotent overwrites.
                    warn!(
                        task_id = %message.task_id(),
                        error = %delete_err,
                        "requeue published but original delete failed, extending instead"
                    );
                    let visibility = (delay_secs as u32).max(self.default_visibility_secs);
                    self.transport.extend_visibility(receipt, visibility).await?;
                    return Ok(MessageDisposition::Extended {
                        visibility_secs: visibility,
                    });
                }
                Ok(MessageDisposition::Acked {
                    retry_message_id: Some(retry_message_id),
                })
            }
            Err(publish_err) => {
                // Never delete the original when the copy did not make it out
                let visibility = if delay_secs > 0 {
                    delay_secs as u32
                } else {
                    self.default_visibility_secs
                };
                warn!(
                    task_id = %message.task_id(),
                    error = %publish_err,
                    visibility_secs = visibility,
                    "republish failed, extending visibility of original"
                );
                self.transport.extend_visibility(receipt, visibility).await?;
                Ok(MessageDisposition::Extended {
                    visibility_secs: visibility,
                })
            }
        }
    }

    /// Requeue delay selection: map failures use the fixed short delay;
    /// reduce failures use the message's own hint when present, then an
    /// upstream retry-after, then computed backoff. The message hint is
    /// taken as-is up to the transport maximum; only computed delays are
    /// subject to the backoff cap.
    fn select_delay_secs(
        &self,
        message: &TaskMessage,
        cause: &PipelineError,
        next_attempt: u32,
        budget: &RetryBudget,
    ) -> u64 {
        let raw = match message {
            TaskMessage::Map(_) => self.map_retry_delay_secs as u64,
            TaskMessage::Reduce(_) => message
                .retry_delay_hint_secs()
                .or_else(|| {
                    self.policy
                        .delay_for(cause, next_attempt)
                        .map(|d| d.as_secs())
                })
                .unwrap_or_else(|| self.policy.backoff_ceiling(next_attempt)),
        };
        let clamped = raw.min(self.transport.max_delay_secs() as u64);
        budget.clamp_secs(clamped)
    }
}
