//! Cluster Client Seams
//!
//! The narrow interfaces the bridge consumes from the search cluster.
//! Everything above this module talks to `dyn CoordinationService` and
//! `dyn SearchClusterClient` only, so the HTTP client and the in-memory
//! cluster are interchangeable.

use super::protocol::{BulkUpdateResponse, PageRequest, PageResponse, UpdateTarget};
use crate::error::ClientError;
use crate::indexing::types::IndexableDocument;
use crate::topology::types::{CollectionState, ShardEndpoint};

use async_trait::async_trait;
use std::sync::Arc;

/// Read access to the cluster's coordination service.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// `Ok(None)` when the collection does not exist.
    async fn collection_state(&self, collection: &str)
    -> Result<Option<CollectionState>, ClientError>;
}

/// Query, upsert and commit primitives of the search cluster.
#[async_trait]
pub trait SearchClusterClient: Send + Sync {
    /// Fetches one page from a single shard replica, without distributed fan-out.
    async fn query_page(
        &self,
        endpoint: &ShardEndpoint,
        request: &PageRequest,
    ) -> Result<PageResponse, ClientError>;

    /// Inserts or replaces documents by id.
    async fn bulk_upsert(
        &self,
        collection: &str,
        target: &UpdateTarget,
        docs: &[IndexableDocument],
    ) -> Result<BulkUpdateResponse, ClientError>;

    async fn commit(&self, collection: &str) -> Result<(), ClientError>;

    /// Whether `UpdateTarget::Shard` is honoured. Clients that return `false`
    /// only ever receive `UpdateTarget::Coordinator`.
    fn supports_shard_routing(&self) -> bool {
        false
    }
}

/// Hands out process-local clients on a worker.
///
/// Partitions only carry the coordinator address; the worker asks its provider
/// for a client when the partition is actually iterated.
pub trait ClientProvider: Send + Sync {
    fn client_for(&self, coordinator: &str) -> Result<Arc<dyn SearchClusterClient>, ClientError>;
}

/// Provider that returns the same client for every coordinator.
pub struct StaticClientProvider {
    client: Arc<dyn SearchClusterClient>,
}

impl StaticClientProvider {
    pub fn new(client: Arc<dyn SearchClusterClient>) -> Arc<Self> {
        Arc::new(Self { client })
    }
}

impl ClientProvider for StaticClientProvider {
    fn client_for(&self, _coordinator: &str) -> Result<Arc<dyn SearchClusterClient>, ClientError> {
        Ok(self.client.clone())
    }
}
