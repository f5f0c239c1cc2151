//! # Plenum Core
//!
//! Asynchronous task-queue processor that turns deliberative meeting minutes
//! into summarized, queryable records through a two-phase map/reduce
//! pipeline.
//!
//! ## Architecture
//!
//! - **Map phase**: each task summarizes one transcript chunk with a single
//!   rate-limited generation call and writes a partial result blob.
//! - **Reduce phase**: once every dependency blob exists, one task combines
//!   the chunk results, runs a final generation call, and persists the
//!   merged record plus its query-index rows.
//! - **Delivery model**: at-least-once. Failed tasks are republished with an
//!   incremented attempt counter and a computed delay; when republishing is
//!   impossible the original message's visibility is extended instead.
//!   Downstream writes are idempotent overwrites, so duplicate deliveries
//!   are harmless.
//!
//! ## Module Organization
//!
//! - [`config`] — environment-sourced, validated configuration
//! - [`error`] — pipeline error taxonomy and retryability classification
//! - [`generation`] — generation-service contract and the protected wrapper
//!   (rate limit, timeout, circuit breaker)
//! - [`messaging`] — task message codec and queue transports
//! - [`records`] — record model, chunk merging, date normalization
//! - [`resilience`] — token bucket, retry policy, circuit breaker
//! - [`storage`] — blob store, single-table store, multi-index writer
//! - [`worker`] — executors, ack/requeue protocol, poll loop

pub mod config;
pub mod error;
pub mod generation;
pub mod logging;
pub mod messaging;
pub mod records;
pub mod resilience;
pub mod storage;
pub mod worker;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use messaging::TaskMessage;
pub use records::Record;
pub use worker::TaskProcessor;
