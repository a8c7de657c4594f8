//! Cluster Wire Protocol
//!
//! Endpoints and Data Transfer Objects exchanged with the search cluster.
//! Serialized as JSON over HTTP; the in-memory cluster uses the same types directly.

use crate::indexing::types::IndexableDocument;
use crate::query::types::{Query, Record, SortClause};
use crate::topology::types::{ShardEndpoint, ShardId};

use serde::{Deserialize, Serialize};

// --- API Endpoints ---

/// Coordination service: `GET {coordinator}/admin/collections/{name}`.
pub const ENDPOINT_COLLECTION_STATE: &str = "/admin/collections";
/// Prefix under which collections are served: `{base}/index/{collection}/...`.
pub const INDEX_PREFIX: &str = "/index";
/// Single-shard paginated query.
pub const ENDPOINT_SELECT: &str = "select";
/// Bulk upsert.
pub const ENDPOINT_UPDATE: &str = "update";
/// Explicit commit (makes pending writes visible).
pub const ENDPOINT_COMMIT: &str = "commit";

// --- Data Transfer Objects ---

/// One page of a single-shard sub-query.
///
/// `sort` is already the effective sort (terminated by `id`). `cursor` is
/// `*` for the first page and otherwise the token the previous page returned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageRequest {
    pub collection: String,
    pub shard: ShardId,
    pub replica_id: String,
    pub q: String,
    pub filters: Vec<String>,
    pub fields: Vec<String>,
    pub sort: Vec<SortClause>,
    pub rows: usize,
    pub cursor: String,
}

impl PageRequest {
    pub fn for_shard(
        collection: &str,
        endpoint: &ShardEndpoint,
        query: &Query,
        sort: &[SortClause],
        cursor: &str,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            shard: endpoint.shard_id.clone(),
            replica_id: endpoint.replica_id.clone(),
            q: query.q.clone(),
            filters: query.filters.clone(),
            fields: query.fields.clone(),
            sort: sort.to_vec(),
            rows: query.page_size.max(1),
            cursor: cursor.to_string(),
        }
    }
}

/// Up to `rows` records plus the continuation.
///
/// `next_cursor` is `None`, or equal to the request cursor, once the shard is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageResponse {
    pub docs: Vec<Record>,
    pub next_cursor: Option<String>,
    /// Total matches on this shard, independent of paging.
    pub num_found: u64,
}

/// Where a bulk update is sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum UpdateTarget {
    /// Let the cluster route every document.
    Coordinator,
    /// Send straight to a replica of the owning shard.
    Shard(ShardEndpoint),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkUpdateRequest {
    pub collection: String,
    pub shard: Option<ShardId>,
    pub docs: Vec<IndexableDocument>,
}

/// A document the cluster refused while accepting the rest of the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedDocument {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BulkUpdateResponse {
    pub accepted: usize,
    #[serde(default)]
    pub rejected: Vec<RejectedDocument>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    pub success: bool,
}

/// Error body returned by the HTTP handlers.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn collection_url(base_url: &str, collection: &str, endpoint: &str) -> String {
    format!(
        "{}/{}/{}",
        base_url.trim_end_matches('/'),
        collection,
        endpoint
    )
}
