use crate::engine::types::{Partition, WorkerContext};
use crate::error::ShardQueryError;
use crate::query::pager::{RecordStream, ShardPager};
use crate::query::types::{Query, Record};
use crate::topology::types::ShardEndpoint;

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One shard of a sharded query, described by reference.
///
/// Holds addresses and query parameters only. The client is looked up on the
/// worker when the partition is computed, and every computation starts a fresh
/// walk from the shard's first page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardPartition {
    pub index: usize,
    pub collection: String,
    /// Coordinator the worker's client pool is keyed by.
    pub coordinator: String,
    pub shard: ShardEndpoint,
    pub query: Query,
}

impl Partition for ShardPartition {
    type Item = Result<Record, ShardQueryError>;

    fn index(&self) -> usize {
        self.index
    }

    fn compute(self, ctx: &WorkerContext) -> RecordStream {
        tracing::debug!(
            "Worker {} reading shard {} of '{}' (partition {})",
            ctx.worker_id,
            self.shard.shard_id,
            self.collection,
            self.index
        );

        match ctx.clients.client_for(&self.coordinator) {
            Ok(client) => {
                ShardPager::new(client, &self.collection, self.shard, Arc::new(self.query))
                    .into_stream()
            }
            Err(cause) => stream::iter(vec![Err(ShardQueryError {
                shard: self.shard.shard_id,
                endpoint: self.shard.base_url,
                emitted: 0,
                cause,
            })])
            .boxed(),
        }
    }
}
