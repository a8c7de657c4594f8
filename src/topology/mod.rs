//! Shard Topology Module
//!
//! Discovers which replica to talk to for every shard of a collection.
//! The coordination service owns the cluster state; this module only reads it.
//!
//! ## Core Mechanisms
//! - **Liveness Filtering**: Only `Active` replicas on live nodes are candidates.
//! - **Sticky Replica Choice**: Candidates are sorted by replica id and picked by
//!   hashing an affinity key with the shard id, so repeated resolutions within one
//!   job land on the same replica while different jobs spread across replicas.
//! - **No Caching**: Topology is re-read on every resolution. A stale shard list
//!   would silently drop a shard from the fan-out.
//! - **Document Routing**: `route_document` maps a document id to its shard index,
//!   shared by the indexing pipeline and the in-memory cluster.

pub mod resolver;
pub mod types;
