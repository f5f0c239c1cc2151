//! # Worker
//!
//! Message-driven execution layer: the poll loop, the two task executors,
//! and the ack/requeue protocol that settles every delivery.

pub mod map_executor;
pub mod processor;
pub mod reduce_executor;
pub mod requeue;

pub use map_executor::MapExecutor;
pub use processor::TaskProcessor;
pub use reduce_executor::ReduceExecutor;
pub use requeue::{MessageDisposition, RequeueProtocol, RetryBudget};
