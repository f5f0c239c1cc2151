//! # Messaging Layer
//!
//! The task message codec and the queue transport it travels over.

pub mod message;
pub mod queue;

pub use message::{MapTask, MeetingInfo, ReduceTask, TaskMessage};
pub use queue::{DeliveryReceipt, MemoryQueue, PgmqQueue, QueueDelivery, QueueTransport};
