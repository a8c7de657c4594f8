//! Indexing Module Tests
//!
//! Validates the write path from raw records to visible documents.
//!
//! ## Test Scopes
//! - **Mapping**: JSON and delimited mappers, coercion, id and required-field rules.
//! - **Write Path**: Chunking, shard routing, retry of transient failures,
//!   isolation of permanent ones.
//! - **Flow Control**: Backpressure and shutdown.
//! - **Retry**: Backoff growth, cap and jitter; retried commits.
//! - **Commit Policy**: Delegated, per batch, every N batches, time windows, flush.
//! - **Streaming**: Micro-batch streams and the round trip back through a sharded collection.

#[cfg(test)]
mod tests {
    use crate::cluster::client::{SearchClusterClient, StaticClientProvider};
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::protocol::{BulkUpdateResponse, PageRequest, PageResponse, UpdateTarget};
    use crate::collection::sharded::ShardedCollection;
    use crate::config::IndexingSettings;
    use crate::engine::local::LocalEngine;
    use crate::engine::stream::{micro_batches, queue_stream};
    use crate::error::{ClientError, IndexingError, MappingError};
    use crate::indexing::commit::CommitTracker;
    use crate::indexing::mapping::{
        DelimitedFieldMapper, FieldKind, FieldMapper, FieldSpec, JsonFieldMapper, mapper_fn,
    };
    use crate::indexing::pipeline::IndexingPipeline;
    use crate::indexing::streaming::index_stream;
    use crate::indexing::types::{CommitOutcome, CommitPolicy, IndexableDocument};
    use crate::query::types::{Query, ShardFailurePolicy};
    use crate::topology::resolver::ShardTopologyResolver;
    use crate::topology::types::{ShardEndpoint, ShardId};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const COLLECTION: &str = "test";

    fn settings(commit: CommitPolicy) -> IndexingSettings {
        IndexingSettings {
            max_chunk_size: 10,
            retry_limit: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 5,
            backlog_threshold: 8,
            max_parallel_chunks: 4,
            shard_routing: true,
            commit,
        }
    }

    fn csv_mapper() -> Arc<dyn FieldMapper<String>> {
        Arc::new(DelimitedFieldMapper::csv(["id", "field1", "field2"]))
    }

    fn rows(ids: std::ops::Range<usize>) -> Vec<String> {
        ids.map(|i| format!("{},foo,bar", i)).collect()
    }

    fn cluster_with(shards: usize) -> Arc<InMemoryCluster> {
        let cluster = InMemoryCluster::new();
        cluster.create_collection(COLLECTION, shards, 1);
        cluster
    }

    /// Delays every bulk request and cannot address shards directly.
    struct SlowClient {
        inner: Arc<InMemoryCluster>,
        delay: Duration,
    }

    #[async_trait]
    impl SearchClusterClient for SlowClient {
        async fn query_page(
            &self,
            endpoint: &ShardEndpoint,
            request: &PageRequest,
        ) -> Result<PageResponse, ClientError> {
            self.inner.query_page(endpoint, request).await
        }

        async fn bulk_upsert(
            &self,
            collection: &str,
            target: &UpdateTarget,
            docs: &[IndexableDocument],
        ) -> Result<BulkUpdateResponse, ClientError> {
            tokio::time::sleep(self.delay).await;
            self.inner.upsert(collection, target, docs)
        }

        async fn commit(&self, collection: &str) -> Result<(), ClientError> {
            self.inner.commit_all(collection)
        }
    }

    /// Fails the next `commit_failures` commits with a 503.
    struct FlakyCommitClient {
        inner: Arc<InMemoryCluster>,
        commit_failures: AtomicUsize,
        commit_attempts: AtomicUsize,
    }

    #[async_trait]
    impl SearchClusterClient for FlakyCommitClient {
        async fn query_page(
            &self,
            endpoint: &ShardEndpoint,
            request: &PageRequest,
        ) -> Result<PageResponse, ClientError> {
            self.inner.query_page(endpoint, request).await
        }

        async fn bulk_upsert(
            &self,
            collection: &str,
            target: &UpdateTarget,
            docs: &[IndexableDocument],
        ) -> Result<BulkUpdateResponse, ClientError> {
            self.inner.upsert(collection, target, docs)
        }

        async fn commit(&self, collection: &str) -> Result<(), ClientError> {
            self.commit_attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .commit_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ClientError::Server {
                    status: 503,
                    message: "commit unavailable".to_string(),
                });
            }
            self.inner.commit_all(collection)
        }
    }

    // ============================================================
    // MAPPING TESTS
    // ============================================================

    #[test]
    fn test_json_mapper_coerces_declared_fields() {
        // ARRANGE
        let mapper = JsonFieldMapper::new(vec![
            FieldSpec::new("title", FieldKind::Text),
            FieldSpec::new("views", FieldKind::Long),
            FieldSpec::new("price", FieldKind::Double),
            FieldSpec::new("active", FieldKind::Bool),
            FieldSpec::new("tags", FieldKind::Strings).to("tag"),
        ]);
        let raw = json!({
            "id": 7,
            "title": "Moby Dick",
            "views": "42",
            "price": 1.5,
            "active": "true",
            "tags": ["sea", null, "whale"],
            "ignored": 1
        });

        // ACT
        let doc = FieldMapper::<Value>::map(&mapper, &raw).unwrap();

        // ASSERT
        assert_eq!(doc.id, "7");
        assert_eq!(doc.fields.get("title"), Some(&json!("Moby Dick")));
        assert_eq!(doc.fields.get("views"), Some(&json!(42)));
        assert_eq!(doc.fields.get("price"), Some(&json!(1.5)));
        assert_eq!(doc.fields.get("active"), Some(&json!(true)));
        assert_eq!(doc.fields.get("tag"), Some(&json!(["sea", "whale"])));
        assert!(!doc.fields.contains_key("tags"));
        assert!(!doc.fields.contains_key("ignored"));
    }

    #[test]
    fn test_json_mapper_rejects_unusable_records() {
        let mapper = JsonFieldMapper::new(vec![
            FieldSpec::new("title", FieldKind::Text).required(),
            FieldSpec::new("views", FieldKind::Long),
        ]);

        let no_id = FieldMapper::<Value>::map(&mapper, &json!({"title": "x"}));
        assert_eq!(no_id, Err(MappingError::MissingId));

        let blank_id = FieldMapper::<Value>::map(&mapper, &json!({"id": "  ", "title": "x"}));
        assert_eq!(blank_id, Err(MappingError::MissingId));

        let no_title = FieldMapper::<Value>::map(&mapper, &json!({"id": "1", "title": null}));
        assert_eq!(no_title, Err(MappingError::MissingField("title".to_string())));

        let bad_views =
            FieldMapper::<Value>::map(&mapper, &json!({"id": "1", "title": "x", "views": "many"}));
        assert!(matches!(bad_views, Err(MappingError::InvalidField { ref field, .. }) if field == "views"));

        let not_object = FieldMapper::<Value>::map(&mapper, &json!([1, 2]));
        assert!(matches!(not_object, Err(MappingError::Malformed(_))));

        let not_json = FieldMapper::<String>::map(&mapper, &"{not json".to_string());
        assert!(matches!(not_json, Err(MappingError::Malformed(_))));
    }

    #[test]
    fn test_json_mapper_custom_id_field_from_text() {
        let mapper = JsonFieldMapper::new(vec![FieldSpec::new("name", FieldKind::Text)])
            .with_id_field("isbn");

        let doc = FieldMapper::<String>::map(
            &mapper,
            &r#"{"isbn": "978-3", "name": "Dune"}"#.to_string(),
        )
        .unwrap();

        assert_eq!(doc.id, "978-3");
        assert_eq!(doc.fields.get("name"), Some(&json!("Dune")));
    }

    #[test]
    fn test_delimited_mapper_rows() {
        let mapper = DelimitedFieldMapper::csv(["id", "field1", "field2"]);

        let doc = mapper.map(&"1,foo,bar".to_string()).unwrap();
        assert_eq!(doc.id, "1");
        assert_eq!(doc.fields.get("field1"), Some(&json!("foo")));
        assert_eq!(doc.fields.get("field2"), Some(&json!("bar")));

        let sparse = mapper.map(&" 4 , , baz".to_string()).unwrap();
        assert_eq!(sparse.id, "4");
        assert!(!sparse.fields.contains_key("field1"));
        assert_eq!(sparse.fields.get("field2"), Some(&json!("baz")));

        let short = mapper.map(&"5,foo".to_string()).unwrap();
        assert_eq!(short.fields.len(), 1);

        assert!(matches!(
            mapper.map(&"1,foo,bar,extra".to_string()),
            Err(MappingError::Malformed(_))
        ));
        assert_eq!(mapper.map(&",foo,bar".to_string()), Err(MappingError::MissingId));
    }

    #[test]
    fn test_delimited_mapper_custom_delimiter_and_id_column() {
        let mapper = DelimitedFieldMapper::new('|', ["title", "key"]).with_id_column("key");

        let doc = mapper.map(&"Dune|b-1".to_string()).unwrap();

        assert_eq!(doc.id, "b-1");
        assert_eq!(doc.fields.get("title"), Some(&json!("Dune")));
        assert!(!doc.fields.contains_key("key"));
    }

    #[test]
    fn test_closure_mapper_enforces_id() {
        let mapper = mapper_fn(|raw: &(String, i64)| {
            Ok(IndexableDocument::new(raw.0.clone()).with_field("n", raw.1))
        });

        let doc = mapper.map(&("a".to_string(), 3)).unwrap();
        assert_eq!(doc.fields.get("n"), Some(&json!(3)));

        assert_eq!(mapper.map(&(String::new(), 3)), Err(MappingError::MissingId));
    }

    // ============================================================
    // WRITE PATH TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unmappable_records_are_dropped_and_counted() {
        // ARRANGE
        let cluster = cluster_with(2);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );
        let mut batch = rows(0..10);
        batch.push(",no,id".to_string());
        batch.push("1,too,many,columns".to_string());
        batch.push(String::new());

        // ACT
        let outcome = pipeline.submit(batch).await.unwrap();

        // ASSERT
        assert_eq!(outcome.received, 13);
        assert_eq!(outcome.indexed, 10);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.mapping_failures, 3);
        assert_eq!(outcome.mapping_samples.len(), 3);
        assert!(!outcome.is_clean());
        assert_eq!(cluster.visible_count(COLLECTION), 10);
    }

    #[tokio::test]
    async fn test_batch_split_into_bounded_chunks() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );

        let outcome = pipeline.submit(rows(0..25)).await.unwrap();

        assert_eq!(outcome.chunks, 3);
        assert_eq!(cluster.bulk_requests(), 3);
        assert_eq!(outcome.indexed, 25);
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );

        let outcome = pipeline.submit(Vec::new()).await.unwrap();

        assert_eq!(outcome.received, 0);
        assert_eq!(outcome.chunks, 0);
        assert_eq!(cluster.bulk_requests(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_without_duplicates() {
        // ARRANGE
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );
        cluster.fail_next_writes(2, 503);

        // ACT
        let outcome = pipeline.submit(rows(0..8)).await.unwrap();

        // ASSERT
        assert_eq!(outcome.chunks, 1);
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.indexed, 8);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.chunk_failures.is_empty());
        assert_eq!(cluster.bulk_requests(), 3);
        assert_eq!(cluster.visible_count(COLLECTION), 8);
    }

    #[tokio::test]
    async fn test_resubmitting_a_batch_replaces_documents() {
        let cluster = cluster_with(2);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );

        pipeline.submit(rows(0..12)).await.unwrap();
        pipeline.submit(rows(0..12)).await.unwrap();

        assert_eq!(cluster.visible_count(COLLECTION), 12);
    }

    #[tokio::test]
    async fn test_retry_limit_exhausted_fails_chunk() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );
        cluster.fail_next_writes(3, 503);

        let outcome = pipeline.submit(rows(0..4)).await.unwrap();

        assert_eq!(outcome.indexed, 0);
        assert_eq!(outcome.failed, 4);
        assert_eq!(outcome.chunk_failures.len(), 1);
        let failure = &outcome.chunk_failures[0];
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.documents, 4);
        assert!(matches!(failure.cause, ClientError::Server { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_permanent_failure_isolated_to_its_chunk() {
        // ARRANGE
        let cluster = cluster_with(1);
        let mut settings = settings(CommitPolicy::every_batch());
        settings.max_chunk_size = 2;
        settings.max_parallel_chunks = 1;
        let pipeline = IndexingPipeline::new(COLLECTION, cluster.clone(), csv_mapper(), settings);
        cluster.fail_next_writes(1, 400);

        // ACT
        let outcome = pipeline.submit(rows(0..6)).await.unwrap();

        // ASSERT
        assert_eq!(outcome.chunks, 3);
        assert_eq!(outcome.indexed, 4);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.retries, 0);
        assert_eq!(outcome.chunk_failures.len(), 1);
        assert_eq!(outcome.chunk_failures[0].chunk, 0);
        assert_eq!(outcome.chunk_failures[0].attempts, 1);
        assert!(matches!(
            outcome.chunk_failures[0].cause,
            ClientError::Rejected { status: 400, .. }
        ));
        assert_eq!(cluster.visible_count(COLLECTION), 4);
    }

    #[tokio::test]
    async fn test_unknown_collection_fails_every_chunk() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            "missing",
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );

        let outcome = pipeline.submit(rows(0..15)).await.unwrap();

        assert_eq!(outcome.indexed, 0);
        assert_eq!(outcome.failed, 15);
        assert_eq!(outcome.chunk_failures.len(), 2);
    }

    // ============================================================
    // SHARD ROUTING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_shard_routing_sends_chunks_to_owning_shards() {
        // ARRANGE
        let cluster = cluster_with(3);
        let resolver = Arc::new(ShardTopologyResolver::new(cluster.clone()));
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        )
        .with_resolver(resolver);

        // ACT
        let outcome = pipeline.submit(rows(0..60)).await.unwrap();

        // ASSERT
        let per_shard: Vec<usize> = (1..=3)
            .map(|n| cluster.shard_update_count(COLLECTION, &ShardId(format!("shard{}", n))))
            .collect();
        assert_eq!(per_shard.iter().sum::<usize>(), outcome.chunks);
        assert_eq!(outcome.indexed, 60);
        assert_eq!(cluster.shard_sizes(COLLECTION).iter().sum::<usize>(), 60);
        for (requests, size) in per_shard.iter().zip(cluster.shard_sizes(COLLECTION)) {
            assert_eq!(*requests, size.div_ceil(10));
        }
    }

    #[tokio::test]
    async fn test_shard_routing_disabled_uses_coordinator() {
        let cluster = cluster_with(3);
        let mut settings = settings(CommitPolicy::every_batch());
        settings.shard_routing = false;
        let pipeline = IndexingPipeline::new(COLLECTION, cluster.clone(), csv_mapper(), settings)
            .with_resolver(Arc::new(ShardTopologyResolver::new(cluster.clone())));

        let outcome = pipeline.submit(rows(0..30)).await.unwrap();

        assert_eq!(outcome.chunks, 3);
        for n in 1..=3 {
            let shard = ShardId(format!("shard{}", n));
            assert_eq!(cluster.shard_update_count(COLLECTION, &shard), 0);
        }
        assert_eq!(cluster.visible_count(COLLECTION), 30);
    }

    #[tokio::test]
    async fn test_unresolvable_topology_falls_back_to_coordinator() {
        let cluster = cluster_with(2);
        let elsewhere = InMemoryCluster::new();
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        )
        .with_resolver(Arc::new(ShardTopologyResolver::new(elsewhere)));

        let outcome = pipeline.submit(rows(0..5)).await.unwrap();

        assert_eq!(outcome.indexed, 5);
        assert_eq!(outcome.chunks, 1);
        assert_eq!(cluster.shard_update_count(COLLECTION, &ShardId::new("shard1")), 0);
        assert_eq!(cluster.shard_update_count(COLLECTION, &ShardId::new("shard2")), 0);
    }

    #[tokio::test]
    async fn test_client_without_shard_routing_uses_coordinator() {
        let cluster = cluster_with(2);
        let client = Arc::new(SlowClient {
            inner: cluster.clone(),
            delay: Duration::ZERO,
        });
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            client,
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        )
        .with_resolver(Arc::new(ShardTopologyResolver::new(cluster.clone())));

        let outcome = pipeline.submit(rows(0..5)).await.unwrap();

        assert_eq!(outcome.indexed, 5);
        assert_eq!(cluster.shard_update_count(COLLECTION, &ShardId::new("shard1")), 0);
        assert_eq!(cluster.visible_count(COLLECTION), 5);
    }

    // ============================================================
    // FLOW CONTROL TESTS
    // ============================================================

    #[tokio::test]
    async fn test_try_submit_rejects_when_backlog_full() {
        // ARRANGE
        let cluster = cluster_with(1);
        let mut settings = settings(CommitPolicy::Delegated);
        settings.backlog_threshold = 1;
        let client = Arc::new(SlowClient {
            inner: cluster.clone(),
            delay: Duration::from_millis(200),
        });
        let pipeline = Arc::new(IndexingPipeline::new(COLLECTION, client, csv_mapper(), settings));

        let background = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.submit(rows(0..5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ACT
        let in_flight = pipeline.in_flight();
        let rejected = pipeline.try_submit(rows(5..6)).await;

        // ASSERT
        assert_eq!(in_flight, 1);
        assert!(matches!(rejected, Err(IndexingError::Backpressure { in_flight: 1 })));

        let outcome = background.await.unwrap().unwrap();
        assert_eq!(outcome.indexed, 5);
        assert_eq!(pipeline.in_flight(), 0);
        assert_eq!(cluster.pending_count(COLLECTION), 5);
    }

    #[tokio::test]
    async fn test_submit_waits_for_backlog_capacity() {
        let cluster = cluster_with(1);
        let mut settings = settings(CommitPolicy::Delegated);
        settings.backlog_threshold = 1;
        let client = Arc::new(SlowClient {
            inner: cluster.clone(),
            delay: Duration::from_millis(30),
        });
        let pipeline = IndexingPipeline::new(COLLECTION, client, csv_mapper(), settings);

        let (first, second) = tokio::join!(pipeline.submit(rows(0..3)), pipeline.submit(rows(3..6)));

        assert_eq!(first.unwrap().indexed, 3);
        assert_eq!(second.unwrap().indexed, 3);
        assert_eq!(cluster.pending_count(COLLECTION), 6);
    }

    #[tokio::test]
    async fn test_closed_pipeline_rejects_batches() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );

        pipeline.close();

        assert!(matches!(pipeline.submit(rows(0..1)).await, Err(IndexingError::Closed)));
        assert!(matches!(pipeline.try_submit(rows(0..1)).await, Err(IndexingError::Closed)));
        assert_eq!(cluster.bulk_requests(), 0);
    }

    // ============================================================
    // COMMIT POLICY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_delegated_policy_never_commits() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );

        let outcome = pipeline.submit(rows(0..4)).await.unwrap();
        let flushed = pipeline.flush().await;

        assert_eq!(outcome.commit, CommitOutcome::NotRequested);
        assert_eq!(flushed, CommitOutcome::NotRequested);
        assert_eq!(cluster.commit_count(), 0);
        assert_eq!(cluster.visible_count(COLLECTION), 0);
        assert_eq!(cluster.pending_count(COLLECTION), 4);
    }

    #[tokio::test]
    async fn test_delegated_policy_relies_on_auto_soft_commit() {
        let cluster = cluster_with(1);
        cluster.set_auto_soft_commit(true);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );

        pipeline.submit(rows(0..4)).await.unwrap();

        assert_eq!(cluster.commit_count(), 0);
        assert_eq!(cluster.visible_count(COLLECTION), 4);
    }

    #[tokio::test]
    async fn test_commit_every_batch_makes_documents_visible() {
        let cluster = cluster_with(2);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );

        let outcome = pipeline.submit(rows(0..7)).await.unwrap();

        assert_eq!(outcome.commit, CommitOutcome::Committed);
        assert_eq!(cluster.commit_count(), 1);
        assert_eq!(cluster.visible_count(COLLECTION), 7);
        assert_eq!(cluster.pending_count(COLLECTION), 0);
    }

    #[tokio::test]
    async fn test_commit_every_second_batch() {
        // ARRANGE
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Explicit {
                every_batches: Some(2),
                every_secs: None,
            }),
        );

        // ACT
        let first = pipeline.submit(rows(0..3)).await.unwrap();
        let visible_after_first = cluster.visible_count(COLLECTION);
        let second = pipeline.submit(rows(3..6)).await.unwrap();
        let third = pipeline.submit(rows(6..9)).await.unwrap();
        let flushed = pipeline.flush().await;

        // ASSERT
        assert_eq!(first.commit, CommitOutcome::NotRequested);
        assert_eq!(visible_after_first, 0);
        assert_eq!(second.commit, CommitOutcome::Committed);
        assert_eq!(third.commit, CommitOutcome::NotRequested);
        assert_eq!(flushed, CommitOutcome::Committed);
        assert_eq!(cluster.commit_count(), 2);
        assert_eq!(cluster.visible_count(COLLECTION), 9);
    }

    #[tokio::test]
    async fn test_failed_commit_reported_in_outcome() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            "missing",
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );

        let outcome = pipeline.submit(rows(0..2)).await.unwrap();

        assert!(matches!(outcome.commit, CommitOutcome::Failed(_)));
        assert!(!outcome.is_clean());
    }

    #[tokio::test]
    async fn test_commit_tracker_windows() {
        let tracker = CommitTracker::new(CommitPolicy::Explicit {
            every_batches: Some(3),
            every_secs: None,
        });

        assert!(!tracker.record_batch().await);
        assert!(!tracker.record_batch().await);
        assert!(tracker.record_batch().await);
        assert_eq!(tracker.pending_batches().await, 3);

        // Not reset until the commit succeeds.
        assert!(tracker.record_batch().await);

        tracker.mark_committed().await;
        assert_eq!(tracker.pending_batches().await, 0);
        assert!(!tracker.record_batch().await);
    }

    #[tokio::test]
    async fn test_commit_tracker_delegated_is_never_due() {
        let tracker = CommitTracker::new(CommitPolicy::Delegated);

        for _ in 0..10 {
            assert!(!tracker.record_batch().await);
        }
        assert!(!tracker.is_explicit());
        assert_eq!(tracker.pending_batches().await, 0);
    }

    // ============================================================
    // STREAMING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_index_stream_over_queued_batches() {
        // ARRANGE
        let cluster = cluster_with(2);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );
        let batches = queue_stream(
            vec![rows(0..4), vec!["bad".to_string(), ",x".to_string()], rows(4..9)],
            Duration::from_millis(5),
        );

        // ACT
        let report = index_stream(&pipeline, batches).await.unwrap();

        // ASSERT
        assert_eq!(report.batches, 3);
        assert_eq!(report.received, 11);
        assert_eq!(report.indexed, 10);
        assert_eq!(report.mapping_failures, 1);
        assert_eq!(report.failed, 0);
        // One commit per batch plus the final flush.
        assert_eq!(report.commits, 4);
        assert_eq!(cluster.visible_count(COLLECTION), 10);
    }

    #[tokio::test]
    async fn test_index_stream_from_live_sender() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Explicit {
                every_batches: Some(100),
                every_secs: None,
            }),
        );
        let (sender, batches) = micro_batches::<String>(Duration::from_millis(20));

        let producer = tokio::spawn(async move {
            sender.send_all(rows(0..10)).unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender.send_all(rows(10..15)).unwrap();
        });

        let report = index_stream(&pipeline, batches).await.unwrap();
        producer.await.unwrap();

        assert_eq!(report.indexed, 15);
        assert_eq!(report.commits, 1);
        assert_eq!(cluster.visible_count(COLLECTION), 15);
    }

    #[tokio::test]
    async fn test_index_stream_on_closed_pipeline() {
        let cluster = cluster_with(1);
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Delegated),
        );
        pipeline.close();

        let result = index_stream(&pipeline, queue_stream(vec![rows(0..2)], Duration::ZERO)).await;

        assert!(matches!(result, Err(IndexingError::Closed)));
    }

    #[tokio::test]
    async fn test_indexed_rows_readable_through_sharded_collection() {
        // ARRANGE
        let cluster = cluster_with(1);
        let resolver = Arc::new(ShardTopologyResolver::new(cluster.clone()));
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        )
        .with_resolver(resolver.clone());
        let engine = LocalEngine::new(2, StaticClientProvider::new(cluster.clone()));

        // ACT
        let outcome = pipeline
            .submit(vec![
                "1,foo,bar".to_string(),
                "2,foo,baz".to_string(),
                "3,bar,baz".to_string(),
            ])
            .await
            .unwrap();
        let collection = ShardedCollection::new(
            resolver,
            "memory://local",
            COLLECTION,
            Query::match_all(),
            ShardFailurePolicy::FailFast,
        );
        let count = collection.count(&engine).await.unwrap();
        let found = collection.get(&engine, "1").await.unwrap();

        // ASSERT
        assert_eq!(outcome.indexed, 3);
        assert_eq!(count.value, 3);
        assert_eq!(found.value.len(), 1);
        assert_eq!(found.value[0].get("field1"), Some(&json!("foo")));
        assert_eq!(found.value[0].get("field2"), Some(&json!("bar")));
    }

    // ============================================================
    // RETRY TESTS
    // ============================================================

    #[test]
    fn test_backoff_grows_exponentially_up_to_cap() {
        // ARRANGE
        let mut settings = settings(CommitPolicy::Delegated);
        settings.backoff_base_ms = 100;
        settings.backoff_cap_ms = 1000;
        let pipeline = IndexingPipeline::new(COLLECTION, cluster_with(1), csv_mapper(), settings);

        for (attempt, expected) in [(1, 100), (2, 200), (3, 400), (4, 800), (5, 1000), (40, 1000)] {
            for _ in 0..25 {
                // ACT
                let delay = pipeline.backoff(attempt).as_millis() as u64;

                // ASSERT
                assert!(
                    delay >= expected && delay <= expected + 25,
                    "attempt {} waited {}ms, expected {}..={}ms",
                    attempt,
                    delay,
                    expected,
                    expected + 25
                );
            }
        }
    }

    #[tokio::test]
    async fn test_transient_commit_failure_is_retried() {
        // ARRANGE
        let cluster = cluster_with(1);
        let client = Arc::new(FlakyCommitClient {
            inner: cluster.clone(),
            commit_failures: AtomicUsize::new(1),
            commit_attempts: AtomicUsize::new(0),
        });
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            client.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );

        // ACT
        let outcome = pipeline.submit(rows(0..4)).await.unwrap();

        // ASSERT
        assert_eq!(outcome.commit, CommitOutcome::Committed);
        assert_eq!(outcome.retries, 0);
        assert!(outcome.chunk_failures.is_empty());
        assert_eq!(client.commit_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(cluster.visible_count(COLLECTION), 4);
    }

    #[tokio::test]
    async fn test_commit_failing_past_retry_limit_is_reported() {
        let cluster = cluster_with(1);
        let client = Arc::new(FlakyCommitClient {
            inner: cluster.clone(),
            commit_failures: AtomicUsize::new(3),
            commit_attempts: AtomicUsize::new(0),
        });
        let pipeline = IndexingPipeline::new(
            COLLECTION,
            client.clone(),
            csv_mapper(),
            settings(CommitPolicy::every_batch()),
        );

        let outcome = pipeline.submit(rows(0..4)).await.unwrap();

        assert!(matches!(outcome.commit, CommitOutcome::Failed(_)));
        assert_eq!(outcome.indexed, 4);
        assert_eq!(client.commit_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(cluster.visible_count(COLLECTION), 0);
        assert_eq!(cluster.pending_count(COLLECTION), 4);
    }

    // ============================================================
    // COMMIT WINDOW TESTS
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_commit_tracker_time_window() {
        // ARRANGE
        let tracker = CommitTracker::new(CommitPolicy::Explicit {
            every_batches: None,
            every_secs: Some(1),
        });

        // ACT / ASSERT
        assert!(!tracker.record_batch().await);
        assert!(!tracker.is_due_by_time().await);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(tracker.is_due_by_time().await);
        assert!(tracker.record_batch().await);

        tracker.mark_committed().await;
        assert!(!tracker.is_due_by_time().await);

        // Nothing pending, so an elapsed window is not due.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!tracker.is_due_by_time().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_tracker_count_window_ignores_time() {
        let tracker = CommitTracker::new(CommitPolicy::Explicit {
            every_batches: Some(5),
            every_secs: None,
        });

        assert!(!tracker.record_batch().await);
        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(!tracker.is_due_by_time().await);
        assert!(!tracker.record_batch().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_stream_commits_when_window_elapses() {
        // ARRANGE
        let cluster = cluster_with(1);
        let pipeline = Arc::new(IndexingPipeline::new(
            COLLECTION,
            cluster.clone(),
            csv_mapper(),
            settings(CommitPolicy::Explicit {
                every_batches: None,
                every_secs: Some(1),
            }),
        ));
        let (sender, batches) = micro_batches::<String>(Duration::from_millis(100));
        let driver = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { index_stream(&pipeline, batches).await })
        };

        // ACT
        sender.send_all(rows(0..3)).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let visible_before_window = cluster.visible_count(COLLECTION);
        let pending_before_window = cluster.pending_count(COLLECTION);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let visible_after_window = cluster.visible_count(COLLECTION);
        let commits_while_open = cluster.commit_count();

        drop(sender);
        let report = driver.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(visible_before_window, 0);
        assert_eq!(pending_before_window, 3);
        assert_eq!(visible_after_window, 3);
        assert_eq!(commits_while_open, 1);
        assert_eq!(report.indexed, 3);
        // The timed commit plus the final flush.
        assert_eq!(report.commits, 2);
    }
}
