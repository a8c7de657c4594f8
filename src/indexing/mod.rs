//! Indexing Module
//!
//! Pushes continuously arriving records into the cluster as bulk, shard-aware writes.
//!
//! ## Core Mechanisms
//! - **Field Mapping**: Pluggable `FieldMapper`s turn raw records into documents.
//!   Unmappable records are dropped and counted, never fatal.
//! - **Chunking and Routing**: Batches are split into bounded bulk requests, grouped
//!   by owning shard when the client can address shards directly.
//! - **Retry**: Transient chunk failures back off exponentially. Upserts replace by id,
//!   so resending a chunk never duplicates documents.
//! - **Backpressure**: A backlog semaphore bounds chunks in flight across all batches.
//! - **Commit Policy**: Either the cluster's own soft commit, or explicit commits every
//!   N batches or T seconds.
//!
//! ## Submodules
//! - **`types`**: Documents, commit policy and batch outcomes.
//! - **`mapping`**: `FieldMapper`, `JsonFieldMapper`, `DelimitedFieldMapper`, `mapper_fn`.
//! - **`pipeline`**: `IndexingPipeline`.
//! - **`commit`**: `CommitTracker`.
//! - **`streaming`**: `index_stream`, the micro-batch stream driver.

pub mod commit;
pub mod mapping;
pub mod pipeline;
pub mod streaming;
pub mod types;

#[cfg(test)]
mod tests;
