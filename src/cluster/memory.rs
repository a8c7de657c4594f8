//! In-Memory Search Cluster
//!
//! A shard-partitioned document store that behaves like a small search cluster:
//! documents are routed to shards by id hash, become visible on commit (or at once
//! when auto soft commit is on), and are served through cursor-paged single-shard
//! queries. Faults can be injected per shard, per replica and per write.

use super::client::{CoordinationService, SearchClusterClient};
use super::protocol::{
    BulkUpdateResponse, PageRequest, PageResponse, RejectedDocument, UpdateTarget,
};
use crate::error::ClientError;
use crate::indexing::types::IndexableDocument;
use crate::query::types::{
    CURSOR_START, FieldMap, ID_FIELD, Record, SortClause, compare_keys, compare_records,
};
use crate::topology::types::{
    CollectionState, ReplicaInfo, ReplicaState, ShardEndpoint, ShardId, ShardState,
    route_document,
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

static FIELD_PREDICATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][\w.]*):(.+)$").unwrap());

pub const DEFAULT_BASE_URL: &str = "memory://local/index";

#[derive(Default)]
struct ShardStore {
    visible: DashMap<String, FieldMap>,
    pending: DashMap<String, FieldMap>,
}

struct CollectionData {
    state: CollectionState,
    shards: Vec<ShardStore>,
    unreachable: DashSet<ShardId>,
    delays: DashMap<ShardId, Duration>,
    shard_queries: DashMap<ShardId, usize>,
    shard_updates: DashMap<ShardId, usize>,
}

impl CollectionData {
    fn ordinal(&self, shard: &ShardId) -> Option<usize> {
        self.state.shards.iter().position(|s| &s.shard_id == shard)
    }
}

pub struct InMemoryCluster {
    base_url: String,
    auto_soft_commit: std::sync::atomic::AtomicBool,
    collections: DashMap<String, Arc<CollectionData>>,
    replica_states: DashMap<String, ReplicaState>,
    dead_nodes: DashSet<String>,
    replica_counter: AtomicUsize,
    write_failures: AtomicUsize,
    write_failure_status: AtomicU16,
    query_requests: AtomicUsize,
    bulk_requests: AtomicUsize,
    commits: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// `base_url` is what replicas advertise, e.g. `http://127.0.0.1:8983/index`.
    pub fn with_base_url(base_url: &str) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auto_soft_commit: std::sync::atomic::AtomicBool::new(false),
            collections: DashMap::new(),
            replica_states: DashMap::new(),
            dead_nodes: DashSet::new(),
            replica_counter: AtomicUsize::new(1),
            write_failures: AtomicUsize::new(0),
            write_failure_status: AtomicU16::new(503),
            query_requests: AtomicUsize::new(0),
            bulk_requests: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Creates `name` with shards `shard1..=shardN`, each with `replication_factor`
    /// active replicas. The first replica of every shard is its leader.
    pub fn create_collection(&self, name: &str, num_shards: usize, replication_factor: usize) {
        let replication_factor = replication_factor.max(1);
        let shards: Vec<ShardState> = (1..=num_shards)
            .map(|n| ShardState {
                shard_id: ShardId(format!("shard{}", n)),
                replicas: (0..replication_factor)
                    .map(|r| ReplicaInfo {
                        replica_id: format!(
                            "core_node{}",
                            self.replica_counter.fetch_add(1, Ordering::SeqCst)
                        ),
                        base_url: self.base_url.clone(),
                        state: ReplicaState::Active,
                        node_live: true,
                        leader: r == 0,
                    })
                    .collect(),
            })
            .collect();

        let data = CollectionData {
            shards: (0..num_shards).map(|_| ShardStore::default()).collect(),
            state: CollectionState {
                name: name.to_string(),
                replication_factor,
                shards,
            },
            unreachable: DashSet::new(),
            delays: DashMap::new(),
            shard_queries: DashMap::new(),
            shard_updates: DashMap::new(),
        };

        self.collections.insert(name.to_string(), Arc::new(data));
        tracing::info!(
            "Created collection '{}' ({} shards x {} replicas)",
            name,
            num_shards,
            replication_factor
        );
    }

    /// When on, every upsert is visible immediately, like a very frequent soft commit.
    pub fn set_auto_soft_commit(&self, enabled: bool) {
        self.auto_soft_commit.store(enabled, Ordering::SeqCst);
    }

    pub fn set_replica_state(&self, replica_id: &str, state: ReplicaState) {
        self.replica_states.insert(replica_id.to_string(), state);
    }

    pub fn set_node_live(&self, replica_id: &str, live: bool) {
        if live {
            self.dead_nodes.remove(replica_id);
        } else {
            self.dead_nodes.insert(replica_id.to_string());
        }
    }

    /// Queries to `shard` fail with a connect error while the coordination
    /// service keeps advertising it as healthy.
    pub fn make_unreachable(&self, collection: &str, shard: &ShardId) {
        if let Some(data) = self.collections.get(collection) {
            data.unreachable.insert(shard.clone());
        }
    }

    pub fn restore(&self, collection: &str, shard: &ShardId) {
        if let Some(data) = self.collections.get(collection) {
            data.unreachable.remove(shard);
        }
    }

    /// Delays every page response of `shard`.
    pub fn set_shard_delay(&self, collection: &str, shard: &ShardId, delay: Duration) {
        if let Some(data) = self.collections.get(collection) {
            data.delays.insert(shard.clone(), delay);
        }
    }

    /// The next `count` bulk requests fail with `status` before touching any document.
    pub fn fail_next_writes(&self, count: usize, status: u16) {
        self.write_failure_status.store(status, Ordering::SeqCst);
        self.write_failures.store(count, Ordering::SeqCst);
    }

    pub fn query_requests(&self) -> usize {
        self.query_requests.load(Ordering::SeqCst)
    }

    pub fn bulk_requests(&self) -> usize {
        self.bulk_requests.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn shard_query_count(&self, collection: &str, shard: &ShardId) -> usize {
        let Some(data) = self.collections.get(collection) else {
            return 0;
        };
        let count = data.shard_queries.get(shard).map(|count| *count).unwrap_or(0);
        count
    }

    pub fn shard_update_count(&self, collection: &str, shard: &ShardId) -> usize {
        let Some(data) = self.collections.get(collection) else {
            return 0;
        };
        let count = data.shard_updates.get(shard).map(|count| *count).unwrap_or(0);
        count
    }

    pub fn visible_count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|data| data.shards.iter().map(|s| s.visible.len()).sum())
            .unwrap_or(0)
    }

    pub fn pending_count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|data| data.shards.iter().map(|s| s.pending.len()).sum())
            .unwrap_or(0)
    }

    /// Visible document count per shard, in shard order.
    pub fn shard_sizes(&self, collection: &str) -> Vec<usize> {
        self.collections
            .get(collection)
            .map(|data| data.shards.iter().map(|s| s.visible.len()).collect())
            .unwrap_or_default()
    }

    pub fn state(&self, collection: &str) -> Option<CollectionState> {
        let data = self.collections.get(collection)?.value().clone();
        let mut state = data.state.clone();
        for shard in state.shards.iter_mut() {
            for replica in shard.replicas.iter_mut() {
                if let Some(override_state) = self.replica_states.get(&replica.replica_id) {
                    replica.state = override_state.clone();
                }
                replica.node_live = !self.dead_nodes.contains(&replica.replica_id);
            }
        }
        Some(state)
    }

    fn collection(&self, name: &str) -> Result<Arc<CollectionData>, ClientError> {
        self.collections
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClientError::UnknownCollection(name.to_string()))
    }

    pub async fn select(&self, request: &PageRequest) -> Result<PageResponse, ClientError> {
        self.query_requests.fetch_add(1, Ordering::SeqCst);
        let data = self.collection(&request.collection)?;
        let ordinal = data.ordinal(&request.shard).ok_or_else(|| ClientError::Rejected {
            status: 404,
            message: format!("unknown shard {}", request.shard),
        })?;

        *data.shard_queries.entry(request.shard.clone()).or_insert(0) += 1;

        let delay = data.delays.get(&request.shard).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if data.unreachable.contains(&request.shard) {
            return Err(ClientError::Connect(format!(
                "shard {} of '{}' is unreachable",
                request.shard, request.collection
            )));
        }

        page(&data.shards[ordinal], request)
    }

    pub fn upsert(
        &self,
        collection: &str,
        target: &UpdateTarget,
        docs: &[IndexableDocument],
    ) -> Result<BulkUpdateResponse, ClientError> {
        self.bulk_requests.fetch_add(1, Ordering::SeqCst);

        if self.take_write_failure() {
            let status = self.write_failure_status.load(Ordering::SeqCst);
            tracing::debug!("Injected write failure ({}) for '{}'", status, collection);
            return Err(crate::error::classify_status(
                status,
                "injected write failure".to_string(),
            ));
        }

        let data = self.collection(collection)?;
        if let UpdateTarget::Shard(endpoint) = target {
            *data.shard_updates.entry(endpoint.shard_id.clone()).or_insert(0) += 1;
        }

        let auto = self.auto_soft_commit.load(Ordering::SeqCst);
        let mut response = BulkUpdateResponse::default();

        for doc in docs {
            if doc.id.trim().is_empty() {
                response.rejected.push(RejectedDocument {
                    id: doc.id.clone(),
                    reason: "missing required field: id".to_string(),
                });
                continue;
            }

            let store = &data.shards[route_document(&doc.id, data.shards.len())];
            if auto {
                store.pending.remove(&doc.id);
                store.visible.insert(doc.id.clone(), doc.fields.clone());
            } else {
                store.pending.insert(doc.id.clone(), doc.fields.clone());
            }
            response.accepted += 1;
        }

        Ok(response)
    }

    pub fn commit_all(&self, collection: &str) -> Result<(), ClientError> {
        let data = self.collection(collection)?;
        self.commits.fetch_add(1, Ordering::SeqCst);

        let mut published = 0usize;
        for store in &data.shards {
            let keys: Vec<String> = store.pending.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((id, fields)) = store.pending.remove(&key) {
                    store.visible.insert(id, fields);
                    published += 1;
                }
            }
        }

        tracing::debug!("Commit on '{}' published {} documents", collection, published);
        Ok(())
    }

    fn take_write_failure(&self) -> bool {
        self.write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CoordinationService for InMemoryCluster {
    async fn collection_state(
        &self,
        collection: &str,
    ) -> Result<Option<CollectionState>, ClientError> {
        Ok(self.state(collection))
    }
}

#[async_trait]
impl SearchClusterClient for InMemoryCluster {
    async fn query_page(
        &self,
        _endpoint: &ShardEndpoint,
        request: &PageRequest,
    ) -> Result<PageResponse, ClientError> {
        self.select(request).await
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        target: &UpdateTarget,
        docs: &[IndexableDocument],
    ) -> Result<BulkUpdateResponse, ClientError> {
        self.upsert(collection, target, docs)
    }

    async fn commit(&self, collection: &str) -> Result<(), ClientError> {
        self.commit_all(collection)
    }

    fn supports_shard_routing(&self) -> bool {
        true
    }
}

fn page(store: &ShardStore, request: &PageRequest) -> Result<PageResponse, ClientError> {
    let predicates: Vec<Predicate> = std::iter::once(&request.q)
        .chain(request.filters.iter())
        .map(|raw| Predicate::parse(raw))
        .collect();

    let mut matched: Vec<Record> = store
        .visible
        .iter()
        .filter(|entry| predicates.iter().all(|p| p.matches(entry.key(), entry.value())))
        .map(|entry| Record::new(entry.key().clone(), entry.value().clone()))
        .collect();

    let num_found = matched.len() as u64;
    matched.sort_by(|a, b| compare_records(a, b, &request.sort));

    let start = match decode_cursor(&request.cursor, &request.sort)? {
        None => 0,
        Some(position) => matched.partition_point(|record| {
            position_cmp(record, &position, &request.sort) != CmpOrdering::Greater
        }),
    };

    let rows = request.rows.max(1);
    let docs: Vec<Record> = matched[start..]
        .iter()
        .take(rows)
        .map(|record| project(record, &request.fields))
        .collect();

    let next_cursor = if start + docs.len() < matched.len() {
        match matched.get(start + docs.len() - 1) {
            Some(last) => Some(encode_cursor(last, &request.sort)?),
            None => None,
        }
    } else {
        None
    };

    Ok(PageResponse {
        docs,
        next_cursor,
        num_found,
    })
}

fn project(record: &Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record.clone();
    }
    let projected = record
        .fields
        .iter()
        .filter(|(name, _)| fields.iter().any(|f| f == *name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Record::new(record.id.clone(), projected)
}

/// Cursor tokens are the JSON array of the last record's sort values followed by its id.
fn encode_cursor(record: &Record, sort: &[SortClause]) -> Result<String, ClientError> {
    let mut position = record.sort_key(sort);
    position.push(Value::String(record.id.clone()));
    serde_json::to_string(&position).map_err(|e| ClientError::Decode(e.to_string()))
}

fn decode_cursor(token: &str, sort: &[SortClause]) -> Result<Option<Vec<Value>>, ClientError> {
    if token == CURSOR_START {
        return Ok(None);
    }
    let invalid = || ClientError::Rejected {
        status: 400,
        message: format!("invalid cursor: {}", token),
    };
    let position: Vec<Value> = serde_json::from_str(token).map_err(|_| invalid())?;
    if position.len() != sort.len() + 1 {
        return Err(invalid());
    }
    Ok(Some(position))
}

fn position_cmp(record: &Record, position: &[Value], sort: &[SortClause]) -> CmpOrdering {
    let (key, id) = position.split_at(sort.len());
    let id = id.first().and_then(Value::as_str).unwrap_or_default();
    compare_keys(&record.sort_key(sort), key, sort).then_with(|| record.id.as_str().cmp(id))
}

/// The small predicate language the in-memory cluster understands.
#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    All,
    Exists(String),
    Term { field: String, value: String },
    Text(String),
}

impl Predicate {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "*:*" || raw == "*" {
            return Predicate::All;
        }
        if let Some(captures) = FIELD_PREDICATE.captures(raw) {
            let field = captures[1].to_string();
            let value = captures[2].trim().trim_matches('"').to_string();
            if value == "*" {
                return Predicate::Exists(field);
            }
            return Predicate::Term { field, value };
        }
        Predicate::Text(raw.to_lowercase())
    }

    fn matches(&self, id: &str, fields: &FieldMap) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Exists(field) => field == ID_FIELD || fields.contains_key(field),
            Predicate::Term { field, value } if field == ID_FIELD => id == value,
            Predicate::Term { field, value } => fields
                .get(field)
                .map(|v| value_equals(v, value))
                .unwrap_or(false),
            Predicate::Text(needle) => fields.values().any(|v| value_contains(v, needle)),
        }
    }
}

fn value_equals(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Number(n) => n.to_string() == expected,
        Value::Bool(b) => b.to_string() == expected,
        Value::Array(values) => values.iter().any(|v| value_equals(v, expected)),
        _ => false,
    }
}

fn value_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Array(values) => values.iter().any(|v| value_contains(v, needle)),
        _ => false,
    }
}
