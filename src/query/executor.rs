use super::merge::SortedMerge;
use super::pager::{RecordStream, ShardPager, halt_after_error};
use super::types::{OrderingMode, Query, Record, ShardFailurePolicy};
use crate::cluster::client::SearchClusterClient;
use crate::error::{QueryError, ShardQueryError, TopologyError};
use crate::topology::resolver::ShardTopologyResolver;
use crate::topology::types::{ShardEndpoint, ShardId};

use futures::StreamExt;
use futures::stream::select_all;
use std::sync::Arc;

/// Issues one paginated sub-query per shard and combines the results.
pub struct ShardedQueryExecutor {
    client: Arc<dyn SearchClusterClient>,
    ordering: OrderingMode,
    policy: ShardFailurePolicy,
}

impl ShardedQueryExecutor {
    pub fn new(
        client: Arc<dyn SearchClusterClient>,
        ordering: OrderingMode,
        policy: ShardFailurePolicy,
    ) -> Self {
        Self {
            client,
            ordering,
            policy,
        }
    }

    pub fn ordering(&self) -> OrderingMode {
        self.ordering
    }

    pub fn policy(&self) -> ShardFailurePolicy {
        self.policy
    }

    /// Plans the fan-out. No request is sent until the results are iterated.
    pub fn execute(
        &self,
        collection: &str,
        query: &Query,
        shards: &[ShardEndpoint],
    ) -> ShardedResults {
        let query = Arc::new(query.clone());
        let pagers = shards
            .iter()
            .map(|endpoint| {
                ShardPager::new(self.client.clone(), collection, endpoint.clone(), query.clone())
            })
            .collect();

        tracing::debug!(
            "Planned query on '{}' across {} shards ({:?}, {:?})",
            collection,
            shards.len(),
            self.ordering,
            self.policy
        );

        ShardedResults {
            pagers,
            ordering: self.ordering,
            policy: self.policy,
        }
    }

    /// Resolves the current topology, then plans the fan-out.
    ///
    /// Topology is read fresh on every call.
    pub async fn execute_resolved(
        &self,
        resolver: &ShardTopologyResolver,
        collection: &str,
        query: &Query,
    ) -> Result<ShardedResults, TopologyError> {
        let shards = resolver.resolve(collection).await?;
        Ok(self.execute(collection, query, &shards))
    }
}

/// The lazy outcome of a sharded query.
pub struct ShardedResults {
    pagers: Vec<ShardPager>,
    ordering: OrderingMode,
    policy: ShardFailurePolicy,
}

impl ShardedResults {
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.pagers.iter().map(|p| p.shard_id().clone()).collect()
    }

    /// One independent stream per shard, in shard order.
    pub fn into_shard_streams(self) -> Vec<(ShardId, RecordStream)> {
        self.pagers
            .into_iter()
            .map(|pager| (pager.shard_id().clone(), pager.into_stream()))
            .collect()
    }

    /// All shards combined per the ordering mode. Under `FailFast` the stream
    /// ends right after the first shard failure.
    pub fn into_stream(self) -> RecordStream {
        let stream = match self.ordering {
            OrderingMode::PerShard => {
                select_all(self.pagers.into_iter().map(ShardPager::into_stream)).boxed()
            }
            OrderingMode::GlobalSort => SortedMerge::new(self.pagers, self.policy).into_stream(),
        };

        match self.policy {
            ShardFailurePolicy::FailFast => halt_after_error(stream),
            ShardFailurePolicy::AllowPartial => stream,
        }
    }

    /// Drains every shard into memory.
    pub async fn collect(self) -> Result<QueryOutcome, QueryError> {
        let policy = self.policy;
        let mut stream = self.into_stream();
        let mut outcome = QueryOutcome::default();

        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => outcome.records.push(record),
                Err(err) if policy == ShardFailurePolicy::FailFast => {
                    return Err(QueryError::Shard(err));
                }
                Err(err) => outcome.failed_shards.push(err),
            }
        }

        if outcome.is_partial() {
            tracing::warn!(
                "Partial result: {} records, {} shards failed",
                outcome.records.len(),
                outcome.failed_shards.len()
            );
        }
        Ok(outcome)
    }
}

/// A fully collected query result.
#[derive(Debug, Default)]
pub struct QueryOutcome {
    pub records: Vec<Record>,
    /// Non-empty only under `AllowPartial`.
    pub failed_shards: Vec<ShardQueryError>,
}

impl QueryOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed_shards.is_empty()
    }
}
