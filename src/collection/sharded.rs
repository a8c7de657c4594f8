use super::partition::ShardPartition;
use crate::cluster::client::SearchClusterClient;
use crate::config::BridgeConfig;
use crate::engine::local::LocalEngine;
use crate::error::{EngineError, QueryError, ShardQueryError};
use crate::query::executor::{ShardedQueryExecutor, ShardedResults};
use crate::query::types::{ID_FIELD, OrderingMode, Query, Record, ShardFailurePolicy};
use crate::topology::resolver::ShardTopologyResolver;

use futures::StreamExt;
use futures::future;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::{Arc, OnceLock};

/// A value computed over the shards that answered, plus the ones that did not.
#[derive(Debug)]
pub struct PartialResult<T> {
    pub value: T,
    /// Always empty under `FailFast`.
    pub failed_shards: Vec<ShardQueryError>,
}

impl<T> PartialResult<T> {
    pub fn is_complete(&self) -> bool {
        self.failed_shards.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PartialResult<U> {
        PartialResult {
            value: f(self.value),
            failed_shards: self.failed_shards,
        }
    }
}

enum PartitionOutcome<T> {
    Done(T),
    Failed(ShardQueryError),
}

/// The result of a query, exposed as one engine partition per shard.
#[derive(Clone)]
pub struct ShardedCollection {
    resolver: Arc<ShardTopologyResolver>,
    coordinator: String,
    collection: String,
    query: Query,
    policy: ShardFailurePolicy,
}

impl ShardedCollection {
    pub fn new(
        resolver: Arc<ShardTopologyResolver>,
        coordinator: &str,
        collection: &str,
        query: Query,
        policy: ShardFailurePolicy,
    ) -> Self {
        Self {
            resolver,
            coordinator: coordinator.to_string(),
            collection: collection.to_string(),
            query,
            policy,
        }
    }

    /// A collection over `q` with the configured fields, sort, page size and policy.
    pub fn from_config(config: &BridgeConfig, resolver: Arc<ShardTopologyResolver>, q: &str) -> Self {
        Self::new(
            resolver,
            &config.coordinator_url,
            &config.collection,
            config.query.query(q),
            config.query.on_shard_failure,
        )
    }

    pub fn with_query(&self, query: Query) -> Self {
        Self {
            query,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.collection
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn policy(&self) -> ShardFailurePolicy {
        self.policy
    }

    /// One partition per shard of the current topology, in shard order.
    ///
    /// Only the coordination service is consulted; no shard is queried.
    pub async fn partitions(&self) -> Result<Vec<ShardPartition>, QueryError> {
        let endpoints = self.resolver.resolve(&self.collection).await?;

        Ok(endpoints
            .into_iter()
            .enumerate()
            .map(|(index, shard)| ShardPartition {
                index,
                collection: self.collection.clone(),
                coordinator: self.coordinator.clone(),
                shard,
                query: self.query.clone(),
            })
            .collect())
    }

    /// Runs `f` on every shard's record stream in parallel.
    ///
    /// The value of a failed shard is discarded. Under `FailFast` the whole
    /// call fails with that shard's error instead.
    pub async fn map_partitions<T, F, Fut>(
        &self,
        engine: &LocalEngine,
        f: F,
    ) -> Result<PartialResult<Vec<T>>, QueryError>
    where
        F: Fn(BoxStream<'static, Record>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let partitions = self.partitions().await?;
        let policy = self.policy;
        let f = Arc::new(f);

        let outcomes = engine
            .run(partitions, move |items| {
                let f = f.clone();
                async move {
                    let failure = Arc::new(OnceLock::new());
                    let slot = failure.clone();
                    let records = items
                        .scan((), move |_, item| {
                            future::ready(match item {
                                Ok(record) => Some(record),
                                Err(err) => {
                                    let _ = slot.set(err);
                                    None
                                }
                            })
                        })
                        .boxed();

                    let value = f(records).await?;

                    match (failure.get().cloned(), policy) {
                        (None, _) => Ok(PartitionOutcome::Done(value)),
                        (Some(err), ShardFailurePolicy::AllowPartial) => {
                            Ok(PartitionOutcome::Failed(err))
                        }
                        (Some(err), ShardFailurePolicy::FailFast) => Err(anyhow::Error::new(err)),
                    }
                }
            })
            .await
            .map_err(into_query_error)?;

        let mut result = PartialResult {
            value: Vec::with_capacity(outcomes.len()),
            failed_shards: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                PartitionOutcome::Done(value) => result.value.push(value),
                PartitionOutcome::Failed(err) => result.failed_shards.push(err),
            }
        }

        if !result.is_complete() {
            tracing::warn!(
                "'{}': {} of {} shards failed, returning partial result",
                self.collection,
                result.failed_shards.len(),
                result.failed_shards.len() + result.value.len()
            );
        }
        Ok(result)
    }

    pub async fn count(&self, engine: &LocalEngine) -> Result<PartialResult<u64>, QueryError> {
        let counts = self
            .map_partitions(engine, |records| async move { Ok(records.count().await as u64) })
            .await?;
        Ok(counts.map(|per_shard| per_shard.into_iter().sum()))
    }

    /// Every record, shard by shard in shard order.
    pub async fn collect(&self, engine: &LocalEngine) -> Result<PartialResult<Vec<Record>>, QueryError> {
        let shards = self
            .map_partitions(engine, |records| async move {
                Ok(records.collect::<Vec<_>>().await)
            })
            .await?;
        Ok(shards.map(|per_shard| per_shard.into_iter().flatten().collect()))
    }

    /// Folds each shard with `seq` starting from `zero`, then merges the
    /// per-shard accumulators with `comb`.
    pub async fn aggregate<A, S, C>(
        &self,
        engine: &LocalEngine,
        zero: A,
        seq: S,
        comb: C,
    ) -> Result<PartialResult<A>, QueryError>
    where
        A: Clone + Send + Sync + 'static,
        S: Fn(A, Record) -> A + Send + Sync + 'static,
        C: Fn(A, A) -> A,
    {
        let seq = Arc::new(seq);
        let initial = zero.clone();

        let partials = self
            .map_partitions(engine, move |records| {
                let seq = seq.clone();
                let zero = initial.clone();
                async move {
                    Ok(records
                        .fold(zero, move |acc, record| future::ready(seq(acc, record)))
                        .await)
                }
            })
            .await?;

        Ok(partials.map(|values| values.into_iter().fold(zero, comb)))
    }

    /// Point lookup by id across all shards. Expect zero or one record.
    pub async fn get(&self, engine: &LocalEngine, id: &str) -> Result<PartialResult<Vec<Record>>, QueryError> {
        let query = Query::new(format!("{}:{}", ID_FIELD, id))
            .with_fields(self.query.fields.iter().cloned())
            .with_page_size(1);
        self.with_query(query).collect(engine).await
    }

    /// The same query run from the driver through the sharded executor, e.g.
    /// for a globally sorted stream.
    pub async fn execute(
        &self,
        client: Arc<dyn SearchClusterClient>,
        ordering: OrderingMode,
    ) -> Result<ShardedResults, QueryError> {
        let executor = ShardedQueryExecutor::new(client, ordering, self.policy);
        Ok(executor
            .execute_resolved(&self.resolver, &self.collection, &self.query)
            .await?)
    }
}

fn into_query_error(err: EngineError) -> QueryError {
    match err {
        EngineError::TaskFailed { partition, source } => match source.downcast::<ShardQueryError>() {
            Ok(shard_error) => QueryError::Shard(shard_error),
            Err(source) => QueryError::Engine(EngineError::TaskFailed { partition, source }),
        },
        other => QueryError::Engine(other),
    }
}
