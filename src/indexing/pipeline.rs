//! Micro-Batch Indexing Pipeline
//!
//! Maps a batch of raw records, splits it into bulk-request chunks and upserts
//! them into the cluster.
//!
//! ## Write Path
//! 1. **Map**: each raw record goes through the `FieldMapper`. Failures are counted and dropped.
//! 2. **Plan**: documents are grouped by owning shard (when shard routing is on and the
//!    client supports it) and cut into chunks of at most `max_chunk_size`.
//! 3. **Send**: up to `max_parallel_chunks` chunks of the batch are in flight. Each chunk
//!    holds a backlog permit for as long as it is being sent or retried.
//! 4. **Retry**: transient failures back off exponentially (with jitter) up to
//!    `retry_limit` attempts. A chunk that still fails is reported, its siblings carry on.
//! 5. **Commit**: the `CommitTracker` decides whether this batch triggers an explicit commit.

use super::commit::CommitTracker;
use super::mapping::FieldMapper;
use super::types::{BatchOutcome, CommitOutcome, CommitPolicy, IndexableDocument};
use crate::cluster::client::SearchClusterClient;
use crate::cluster::protocol::{BulkUpdateResponse, UpdateTarget};
use crate::config::{BridgeConfig, IndexingSettings};
use crate::error::{ClientError, IndexingError, PermanentWriteError, TransientWriteError};
use crate::topology::resolver::ShardTopologyResolver;
use crate::topology::types::route_document;

use futures::StreamExt;
use futures::stream;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Mapping errors kept in a `BatchOutcome` for diagnostics.
const MAPPING_SAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy)]
enum RetryTarget {
    Chunk(usize),
    Commit,
}

struct Chunk {
    index: usize,
    target: UpdateTarget,
    docs: Vec<IndexableDocument>,
}

struct ChunkReport {
    documents: usize,
    accepted: usize,
    rejected_ids: Vec<String>,
    retries: u32,
    failure: Option<PermanentWriteError>,
}

pub struct IndexingPipeline<R> {
    collection: String,
    client: Arc<dyn SearchClusterClient>,
    resolver: Option<Arc<ShardTopologyResolver>>,
    mapper: Arc<dyn FieldMapper<R>>,
    settings: IndexingSettings,
    backlog: Arc<Semaphore>,
    commits: CommitTracker,
    closed: AtomicBool,
}

impl<R: Send + Sync + 'static> IndexingPipeline<R> {
    pub fn new(
        collection: &str,
        client: Arc<dyn SearchClusterClient>,
        mapper: Arc<dyn FieldMapper<R>>,
        settings: IndexingSettings,
    ) -> Self {
        Self {
            collection: collection.to_string(),
            client,
            resolver: None,
            mapper,
            backlog: Arc::new(Semaphore::new(settings.backlog_threshold.max(1))),
            commits: CommitTracker::new(settings.commit.clone()),
            settings,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        config: &BridgeConfig,
        client: Arc<dyn SearchClusterClient>,
        resolver: Arc<ShardTopologyResolver>,
        mapper: Arc<dyn FieldMapper<R>>,
    ) -> Self {
        Self::new(&config.collection, client, mapper, config.indexing.clone()).with_resolver(resolver)
    }

    /// Enables shard-aware routing, subject to `shard_routing` and client support.
    pub fn with_resolver(mut self, resolver: Arc<ShardTopologyResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn settings(&self) -> &IndexingSettings {
        &self.settings
    }

    pub fn commit_policy(&self) -> &CommitPolicy {
        self.commits.policy()
    }

    /// Chunks currently holding a backlog permit.
    pub fn in_flight(&self) -> usize {
        self.settings
            .backlog_threshold
            .max(1)
            .saturating_sub(self.backlog.available_permits())
    }

    /// Rejects every later `submit`. Batches already accepted run to completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Indexes one batch, waiting for backlog capacity when needed.
    pub async fn submit(&self, batch: Vec<R>) -> Result<BatchOutcome, IndexingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexingError::Closed);
        }
        self.process(batch).await
    }

    /// Like `submit`, but fails with `Backpressure` instead of waiting when the
    /// backlog is full.
    pub async fn try_submit(&self, batch: Vec<R>) -> Result<BatchOutcome, IndexingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IndexingError::Closed);
        }
        if self.backlog.available_permits() == 0 {
            let in_flight = self.in_flight();
            tracing::warn!(
                "Rejecting batch for '{}': {} chunks in flight",
                self.collection,
                in_flight
            );
            return Err(IndexingError::Backpressure { in_flight });
        }
        self.process(batch).await
    }

    /// Forces an explicit commit now. No-op under the delegated policy.
    pub async fn flush(&self) -> CommitOutcome {
        if !self.commits.is_explicit() {
            return CommitOutcome::NotRequested;
        }
        self.commit().await
    }

    /// Commits if the explicit policy's time window has elapsed since the last
    /// commit and batches are waiting. `None` when nothing was due.
    pub async fn commit_if_due(&self) -> Option<CommitOutcome> {
        if !self.commits.is_due_by_time().await {
            return None;
        }
        tracing::debug!("Commit window on '{}' elapsed", self.collection);
        Some(self.commit().await)
    }

    async fn process(&self, batch: Vec<R>) -> Result<BatchOutcome, IndexingError> {
        let mut outcome = BatchOutcome::empty(batch.len());
        let docs = self.map_batch(batch, &mut outcome);

        if !docs.is_empty() {
            let chunks = self.plan(docs).await;
            outcome.chunks = chunks.len();

            let reports: Vec<ChunkReport> = stream::iter(chunks)
                .map(|chunk| self.send_chunk(chunk))
                .buffer_unordered(self.settings.max_parallel_chunks.max(1))
                .collect()
                .await;

            for report in reports {
                outcome.retries += report.retries;
                outcome.indexed += report.accepted;
                outcome.failed += report.rejected_ids.len();
                outcome.rejected_ids.extend(report.rejected_ids);
                if let Some(failure) = report.failure {
                    outcome.failed += report.documents;
                    outcome.chunk_failures.push(failure);
                }
            }
            outcome.chunk_failures.sort_by_key(|f| f.chunk);
        }

        if self.commits.record_batch().await {
            outcome.commit = self.commit().await;
        }

        tracing::info!(
            "Batch into '{}': {} received, {} indexed, {} failed, {} unmappable ({} chunks, {} retries)",
            self.collection,
            outcome.received,
            outcome.indexed,
            outcome.failed,
            outcome.mapping_failures,
            outcome.chunks,
            outcome.retries
        );

        Ok(outcome)
    }

    fn map_batch(&self, batch: Vec<R>, outcome: &mut BatchOutcome) -> Vec<IndexableDocument> {
        let mut docs = Vec::with_capacity(batch.len());
        for raw in &batch {
            match self.mapper.map(raw) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    tracing::debug!("Dropping unmappable record: {}", e);
                    outcome.mapping_failures += 1;
                    if outcome.mapping_samples.len() < MAPPING_SAMPLE_LIMIT {
                        outcome.mapping_samples.push(e);
                    }
                }
            }
        }

        if outcome.mapping_failures > 0 {
            tracing::warn!(
                "{} of {} records could not be mapped",
                outcome.mapping_failures,
                outcome.received
            );
        }
        docs
    }

    async fn plan(&self, docs: Vec<IndexableDocument>) -> Vec<Chunk> {
        let max = self.settings.max_chunk_size.max(1);

        let routed = match &self.resolver {
            Some(resolver) if self.settings.shard_routing && self.client.supports_shard_routing() => {
                match resolver.resolve(&self.collection).await {
                    Ok(endpoints) => Some(endpoints),
                    Err(e) => {
                        tracing::warn!(
                            "Shard routing unavailable for '{}', sending through the coordinator: {}",
                            self.collection,
                            e
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let groups: Vec<(UpdateTarget, Vec<IndexableDocument>)> = match routed {
            Some(endpoints) => {
                let mut by_shard: Vec<Vec<IndexableDocument>> = vec![Vec::new(); endpoints.len()];
                for doc in docs {
                    by_shard[route_document(&doc.id, endpoints.len())].push(doc);
                }
                endpoints
                    .into_iter()
                    .zip(by_shard)
                    .filter(|(_, docs)| !docs.is_empty())
                    .map(|(endpoint, docs)| (UpdateTarget::Shard(endpoint), docs))
                    .collect()
            }
            None => vec![(UpdateTarget::Coordinator, docs)],
        };

        let mut chunks = Vec::new();
        for (target, docs) in groups {
            let mut docs = docs.into_iter().peekable();
            while docs.peek().is_some() {
                chunks.push(Chunk {
                    index: chunks.len(),
                    target: target.clone(),
                    docs: docs.by_ref().take(max).collect(),
                });
            }
        }
        chunks
    }

    async fn send_chunk(&self, chunk: Chunk) -> ChunkReport {
        let documents = chunk.docs.len();

        let _permit = match self.acquire_permit().await {
            Ok(permit) => permit,
            Err(cause) => {
                return ChunkReport {
                    documents,
                    accepted: 0,
                    rejected_ids: Vec::new(),
                    retries: 0,
                    failure: Some(PermanentWriteError {
                        chunk: chunk.index,
                        documents,
                        attempts: 0,
                        cause,
                    }),
                };
            }
        };

        let attempt_write = || {
            self.client
                .bulk_upsert(&self.collection, &chunk.target, &chunk.docs)
        };

        match self.with_retry(RetryTarget::Chunk(chunk.index), attempt_write).await {
            Ok((response, attempts)) => {
                tracing::debug!(
                    "Chunk {} ({} docs) accepted after {} attempt(s)",
                    chunk.index,
                    documents,
                    attempts
                );
                chunk_accepted(documents, response, attempts)
            }
            Err((cause, attempts)) => {
                let failure = PermanentWriteError {
                    chunk: chunk.index,
                    documents,
                    attempts,
                    cause,
                };
                tracing::error!("{}", failure);
                ChunkReport {
                    documents,
                    accepted: 0,
                    rejected_ids: Vec::new(),
                    retries: attempts.saturating_sub(1),
                    failure: Some(failure),
                }
            }
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, ClientError> {
        if self.backlog.available_permits() == 0 {
            tracing::debug!(
                "Backlog full for '{}' ({} chunks in flight), waiting",
                self.collection,
                self.in_flight()
            );
        }
        self.backlog
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))
    }

    async fn commit(&self) -> CommitOutcome {
        match self
            .with_retry(RetryTarget::Commit, || self.client.commit(&self.collection))
            .await
        {
            Ok(((), _)) => {
                self.commits.mark_committed().await;
                tracing::debug!("Committed '{}'", self.collection);
                CommitOutcome::Committed
            }
            Err((cause, attempts)) => {
                tracing::error!(
                    "Commit on '{}' failed after {} attempts: {}",
                    self.collection,
                    attempts,
                    cause
                );
                CommitOutcome::Failed(cause.to_string())
            }
        }
    }

    /// Runs `op` until it succeeds, fails permanently or `retry_limit` attempts are used.
    async fn with_retry<T, F, Fut>(
        &self,
        target: RetryTarget,
        op: F,
    ) -> Result<(T, u32), (ClientError, u32)>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let limit = self.settings.retry_limit.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(cause) if cause.is_transient() && attempt < limit => {
                    let delay = self.backoff(attempt);
                    match target {
                        RetryTarget::Chunk(chunk) => tracing::warn!(
                            "{}; retrying in {:?}",
                            TransientWriteError {
                                chunk,
                                attempt,
                                cause
                            },
                            delay
                        ),
                        RetryTarget::Commit => tracing::warn!(
                            "Commit on '{}' failed on attempt {}: {}; retrying in {:?}",
                            self.collection,
                            attempt,
                            cause,
                            delay
                        ),
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(cause) => return Err((cause, attempt)),
            }
        }
    }

    /// `base * 2^(attempt-1)`, capped, plus up to a quarter of `base` of jitter.
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.backoff_base_ms;
        let cap = self.settings.backoff_cap_ms;
        let exponential = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(20)).min(cap);
        let jitter = rand::random::<u64>() % (base / 4 + 1);
        Duration::from_millis(exponential + jitter)
    }
}

fn chunk_accepted(documents: usize, response: BulkUpdateResponse, attempts: u32) -> ChunkReport {
    ChunkReport {
        documents,
        accepted: response.accepted,
        rejected_ids: response.rejected.into_iter().map(|r| r.id).collect(),
        retries: attempts - 1,
        failure: None,
    }
}
