//! Error Taxonomy
//!
//! Every failure the bridge can report, grouped by blast radius:
//!
//! - **`TopologyError`**: fatal for a whole query. Partial shard coverage would
//!   silently under-report results, so there is no recovery path.
//! - **`ShardQueryError`**: local to one shard's result stream. The caller's
//!   [`ShardFailurePolicy`](crate::query::types::ShardFailurePolicy) decides
//!   between aborting everything and accepting a partial result.
//! - **`TransientWriteError` / `PermanentWriteError`**: chunk-level write failures.
//!   Transient ones are retried inside the indexing pipeline; permanent ones are
//!   reported per chunk and never block sibling chunks.
//! - **`MappingError`**: one raw record could not become a document. Counted and dropped.

use crate::topology::types::ShardId;

/// Low-level failure reported by a search cluster client or coordination service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    /// 5xx or 429 from the cluster.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 4xx other than 429. Resending the same payload will fail again.
    #[error("request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),
}

impl ClientError {
    /// Whether resending the identical request can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_) | ClientError::Connect(_) | ClientError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ClientError::Connect(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ClientError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            classify_status(status.as_u16(), err.to_string())
        } else {
            ClientError::Connect(err.to_string())
        }
    }
}

/// Maps a non-success HTTP status to the matching client error.
pub fn classify_status(status: u16, message: String) -> ClientError {
    if status >= 500 || status == 429 {
        ClientError::Server { status, message }
    } else {
        ClientError::Rejected { status, message }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("collection '{0}' does not exist")]
    CollectionNotFound(String),

    #[error("collection '{0}' has no shards")]
    NoShards(String),

    #[error("no live replica for shard {shard} of collection '{collection}'")]
    NoLiveReplica { collection: String, shard: ShardId },

    #[error("coordination service unavailable: {0}")]
    Coordination(#[source] ClientError),
}

/// A failure attributed to exactly one shard.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("shard {shard} ({endpoint}) failed after {emitted} records: {cause}")]
pub struct ShardQueryError {
    pub shard: ShardId,
    pub endpoint: String,
    /// Records this shard had already yielded before failing.
    pub emitted: u64,
    #[source]
    pub cause: ClientError,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Shard(#[from] ShardQueryError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("chunk {chunk} attempt {attempt} failed: {cause}")]
pub struct TransientWriteError {
    pub chunk: usize,
    pub attempt: u32,
    #[source]
    pub cause: ClientError,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("chunk {chunk} ({documents} docs) failed after {attempts} attempts: {cause}")]
pub struct PermanentWriteError {
    pub chunk: usize,
    pub documents: usize,
    pub attempts: u32,
    #[source]
    pub cause: ClientError,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MappingError {
    #[error("record has no usable id")]
    MissingId,

    #[error("required field '{0}' is missing")]
    MissingField(String),

    #[error("field '{field}' cannot be coerced: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexingError {
    #[error("indexing backlog full ({in_flight} chunks in flight)")]
    Backpressure { in_flight: usize },

    #[error("indexing pipeline is shut down")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to encode partition {partition}: {reason}")]
    Encode { partition: usize, reason: String },

    #[error("failed to decode partition task {partition}: {reason}")]
    Decode { partition: usize, reason: String },

    #[error("partition {partition} failed: {source}")]
    TaskFailed {
        partition: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("job was cancelled")]
    Cancelled,

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),

    #[error("micro-batch stream is closed")]
    StreamClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
