//! # Storage Layer
//!
//! The two shared mutable resources of the pipeline: the blob store holding
//! chunk inputs and map results, and the single-table record store the
//! multi-index writer fans out into. Both tolerate concurrent writers to
//! different keys; same-key writes are idempotent overwrites.

pub mod blob;
pub mod table;
pub mod writer;

pub use blob::{BlobStore, FsBlobStore, Locator, MemoryBlobStore};
pub use table::{MemoryTableStore, PgTableStore, TableRow, TableStore};
pub use writer::{index_rows, sort_key, RecordWriter};
