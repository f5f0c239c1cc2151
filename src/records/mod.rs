//! # Record Layer
//!
//! Typed shapes for everything the pipeline persists: chunk results from
//! map tasks, the partial record parsed from the reduce generation call,
//! and the final [`Record`] with its canonical date handling.

pub mod dates;
pub mod record;

pub use dates::{month_bucket, normalize_timestamp, normalize_timestamp_str};
pub use record::{dedup_by_key, ChunkResult, PartialRecord, Record, RecordKind};
