use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Active,
    Recovering,
    Down,
}

/// One copy of a shard as published by the coordination service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub replica_id: String,
    pub base_url: String,
    pub state: ReplicaState,
    /// Whether the node hosting the replica is registered as live.
    pub node_live: bool,
    pub leader: bool,
}

impl ReplicaInfo {
    pub fn is_serving(&self) -> bool {
        self.node_live && self.state == ReplicaState::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardState {
    pub shard_id: ShardId,
    pub replicas: Vec<ReplicaInfo>,
}

/// The coordination service's view of a collection.
///
/// `shards` is ordered by shard ordinal; that order defines partition indices
/// and the output of [`route_document`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionState {
    pub name: String,
    pub replication_factor: usize,
    pub shards: Vec<ShardState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub shard_count: usize,
    pub replication_factor: usize,
}

impl From<&CollectionState> for CollectionInfo {
    fn from(state: &CollectionState) -> Self {
        Self {
            name: state.name.clone(),
            shard_count: state.shards.len(),
            replication_factor: state.replication_factor,
        }
    }
}

/// A single addressable replica chosen to serve one shard for a query.
///
/// Derived per resolution. Holds addresses only, never a connection, so it can
/// travel inside serialized partition descriptions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardEndpoint {
    pub shard_id: ShardId,
    pub replica_id: String,
    pub base_url: String,
    pub leader: bool,
}

/// Maps a document id onto a shard index in `0..shard_count`.
pub fn route_document(id: &str, shard_count: usize) -> usize {
    if shard_count == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % shard_count as u64) as usize
}
