use super::types::{CollectionInfo, CollectionState, ReplicaInfo, ShardEndpoint, ShardState};
use crate::cluster::client::CoordinationService;
use crate::error::TopologyError;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Resolves a collection name into one serving replica per shard.
pub struct ShardTopologyResolver {
    coordinator: Arc<dyn CoordinationService>,
    affinity_key: String,
    prefer_leader: bool,
}

impl ShardTopologyResolver {
    /// Creates a resolver with a fresh affinity key, so all resolutions made
    /// through this instance favour the same replicas.
    pub fn new(coordinator: Arc<dyn CoordinationService>) -> Self {
        Self {
            coordinator,
            affinity_key: uuid::Uuid::new_v4().to_string(),
            prefer_leader: false,
        }
    }

    pub fn with_affinity_key(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = key.into();
        self
    }

    pub fn prefer_leader(mut self, prefer: bool) -> Self {
        self.prefer_leader = prefer;
        self
    }

    pub fn affinity_key(&self) -> &str {
        &self.affinity_key
    }

    pub async fn describe(&self, collection: &str) -> Result<CollectionInfo, TopologyError> {
        let state = self.fetch_state(collection).await?;
        Ok(CollectionInfo::from(&state))
    }

    /// Returns exactly one endpoint per shard, in shard order.
    ///
    /// Fails if the collection is unknown or any shard has no serving replica.
    pub async fn resolve(&self, collection: &str) -> Result<Vec<ShardEndpoint>, TopologyError> {
        let state = self.fetch_state(collection).await?;

        if state.shards.is_empty() {
            return Err(TopologyError::NoShards(collection.to_string()));
        }

        let mut endpoints = Vec::with_capacity(state.shards.len());
        for shard in &state.shards {
            let replica =
                self.choose_replica(shard)
                    .ok_or_else(|| TopologyError::NoLiveReplica {
                        collection: collection.to_string(),
                        shard: shard.shard_id.clone(),
                    })?;

            tracing::trace!(
                "Shard {} of '{}' -> replica {} at {}",
                shard.shard_id,
                collection,
                replica.replica_id,
                replica.base_url
            );

            endpoints.push(ShardEndpoint {
                shard_id: shard.shard_id.clone(),
                replica_id: replica.replica_id.clone(),
                base_url: replica.base_url.clone(),
                leader: replica.leader,
            });
        }

        tracing::debug!(
            "Resolved {} shard endpoints for collection '{}'",
            endpoints.len(),
            collection
        );

        Ok(endpoints)
    }

    async fn fetch_state(&self, collection: &str) -> Result<CollectionState, TopologyError> {
        self.coordinator
            .collection_state(collection)
            .await
            .map_err(TopologyError::Coordination)?
            .ok_or_else(|| TopologyError::CollectionNotFound(collection.to_string()))
    }

    pub(crate) fn choose_replica<'a>(&self, shard: &'a ShardState) -> Option<&'a ReplicaInfo> {
        let mut live: Vec<&ReplicaInfo> =
            shard.replicas.iter().filter(|r| r.is_serving()).collect();

        if live.is_empty() {
            return None;
        }

        if self.prefer_leader
            && let Some(leader) = live.iter().find(|r| r.leader)
        {
            return Some(leader);
        }

        live.sort_by(|a, b| a.replica_id.cmp(&b.replica_id));

        let mut hasher = DefaultHasher::new();
        self.affinity_key.hash(&mut hasher);
        shard.shard_id.hash(&mut hasher);
        let idx = (hasher.finish() % live.len() as u64) as usize;

        Some(live[idx])
    }
}
