//! Search Cluster Module
//!
//! Everything that touches the search cluster itself.
//!
//! ## Core Concepts
//! - **Seams**: `CoordinationService` (topology reads) and `SearchClusterClient`
//!   (paged shard queries, bulk upserts, commits) are the only cluster surface the
//!   bridge depends on.
//! - **HTTP Client**: `HttpClusterClient` speaks the JSON protocol in `protocol`,
//!   with one pooled `reqwest::Client` per coordinator on each worker.
//! - **In-Memory Cluster**: `InMemoryCluster` is a shard-partitioned document store
//!   with commit visibility and failure injection. `handlers` serves it over HTTP.

pub mod client;
pub mod handlers;
pub mod http;
pub mod memory;
pub mod protocol;
