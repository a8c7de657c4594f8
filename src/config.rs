//! Configuration
//!
//! Layered the usual way: built-in defaults (`config/default.toml`), then an
//! optional TOML file, then `SHARD_BRIDGE__*` environment variables.
//! `query.on_shard_failure` has no built-in default and must be set by the user.

use crate::error::ConfigError;
use crate::indexing::types::CommitPolicy;
use crate::query::types::{OrderingMode, Query, ShardFailurePolicy, SortClause};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const ENV_PREFIX: &str = "SHARD_BRIDGE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Collection queried and indexed into.
    pub collection: String,
    /// Coordination service address; also the update endpoint when shard routing is off.
    pub coordinator_url: String,
    pub query: QuerySettings,
    pub indexing: IndexingSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub node: Option<NodeSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    pub page_size: usize,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sort: Vec<SortClause>,
    pub ordering: OrderingMode,
    pub on_shard_failure: ShardFailurePolicy,
}

impl QuerySettings {
    /// Builds a query for `q` carrying the configured fields, sort and page size.
    pub fn query(&self, q: &str) -> Query {
        let mut query = Query::new(q)
            .with_fields(self.fields.iter().cloned())
            .with_page_size(self.page_size);
        query.sort = self.sort.clone();
        query
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingSettings {
    /// Upper bound on documents per bulk request.
    pub max_chunk_size: usize,
    /// Maximum attempts per chunk, the first one included.
    pub retry_limit: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Maximum chunks in flight (retries included) across concurrent batches.
    pub backlog_threshold: usize,
    /// Chunks of one batch submitted concurrently.
    pub max_parallel_chunks: usize,
    /// Send chunks straight to the owning shard when the client can.
    pub shard_routing: bool,
    pub commit: CommitPolicy,
}

impl IndexingSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: 500,
            retry_limit: 3,
            backoff_base_ms: 150,
            backoff_cap_ms: 1200,
            backlog_threshold: 8,
            max_parallel_chunks: 4,
            shard_routing: true,
            commit: CommitPolicy::Delegated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    pub request_timeout_ms: u64,
    /// Idle connections kept per host. Keep below the cluster's listener thread count.
    pub max_idle_per_host: usize,
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5000,
            max_idle_per_host: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub workers: usize,
    pub batch_interval_ms: u64,
}

impl EngineSettings {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_interval_ms: 500,
        }
    }
}

/// Settings for the `shard-bridge-node` development server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub bind: SocketAddr,
    #[serde(default)]
    pub auto_soft_commit: bool,
    #[serde(default)]
    pub collections: Vec<NodeCollection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCollection {
    pub name: String,
    pub shards: usize,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
}

fn default_replication_factor() -> usize {
    1
}

impl BridgeConfig {
    /// Loads defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            DEFAULT_CONFIG,
            config::FileFormat::Toml,
        ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with an inline TOML document. No environment lookup.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(
                DEFAULT_CONFIG,
                config::FileFormat::Toml,
            ))
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.collection.trim().is_empty() {
            return invalid("collection must not be empty");
        }
        if self.query.page_size == 0 {
            return invalid("query.page_size must be at least 1");
        }
        if self.indexing.max_chunk_size == 0 {
            return invalid("indexing.max_chunk_size must be at least 1");
        }
        if self.indexing.retry_limit == 0 {
            return invalid("indexing.retry_limit must be at least 1");
        }
        if self.indexing.backoff_base_ms > self.indexing.backoff_cap_ms {
            return invalid("indexing.backoff_base_ms must not exceed backoff_cap_ms");
        }
        if self.indexing.backlog_threshold == 0 || self.indexing.max_parallel_chunks == 0 {
            return invalid("indexing.backlog_threshold and max_parallel_chunks must be at least 1");
        }
        if let CommitPolicy::Explicit {
            every_batches,
            every_secs,
        } = &self.indexing.commit
        {
            if every_batches.unwrap_or(0) == 0 && every_secs.unwrap_or(0) == 0 {
                return invalid("explicit commit needs every_batches or every_secs");
            }
        }
        if self.engine.workers == 0 {
            return invalid("engine.workers must be at least 1");
        }

        Ok(())
    }
}
