//! Shard Bridge Library
//!
//! Connects a parallel compute engine to a sharded search cluster in both directions:
//! query results are read as one partition per shard, and micro-batches of records
//! are written back as shard-aware bulk updates.
//!
//! ## Architecture Modules
//!
//! - **`topology`**: Reads collection state from the coordination service and picks one
//!   healthy replica per shard.
//! - **`cluster`**: The client seams (`CoordinationService`, `SearchClusterClient`), the
//!   JSON/HTTP client, and an in-memory cluster that can also be served over HTTP.
//! - **`query`**: Cursor-paged per-shard readers and the fan-out executor, in shard
//!   order or globally sorted.
//! - **`engine`**: A local worker pool that runs serialized partitions, plus
//!   micro-batch streams.
//! - **`collection`**: The query result as an engine-partitioned collection with
//!   count, collect, aggregate and point lookups.
//! - **`indexing`**: Field mapping, chunking, retry, backpressure and commit policy
//!   for bulk writes.
//! - **`config`** and **`error`**: Layered configuration and the error taxonomy.

pub mod cluster;
pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod indexing;
pub mod query;
pub mod topology;
