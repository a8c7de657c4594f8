use crate::cluster::client::ClientProvider;
use crate::error::EngineError;

use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Unique identifier of a submitted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of parallel work.
///
/// A partition is a *description*: it must serialize without carrying any live
/// connection, because the engine encodes it before handing it to a worker.
/// All I/O starts in [`Partition::compute`], on the worker.
pub trait Partition: Serialize + DeserializeOwned + Send + 'static {
    type Item: Send + 'static;

    fn index(&self) -> usize;

    /// Materializes the partition's lazy item stream on the assigned worker.
    fn compute(self, ctx: &WorkerContext) -> BoxStream<'static, Self::Item>;
}

/// What a worker offers to the partitions it runs.
#[derive(Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    /// Process-local client pool, shared by every worker of the engine.
    pub clients: Arc<dyn ClientProvider>,
}

/// An encoded partition waiting in the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionTask {
    pub job_id: JobId,
    pub index: usize,
    pub payload: Vec<u8>,
}

impl PartitionTask {
    pub fn encode<P: Partition>(job_id: &JobId, partition: &P) -> Result<Self, EngineError> {
        let index = partition.index();
        let payload = bincode::serialize(partition).map_err(|e| EngineError::Encode {
            partition: index,
            reason: e.to_string(),
        })?;

        Ok(Self {
            job_id: job_id.clone(),
            index,
            payload,
        })
    }

    pub fn decode<P: Partition>(&self) -> Result<P, EngineError> {
        bincode::deserialize(&self.payload).map_err(|e| EngineError::Decode {
            partition: self.index,
            reason: e.to_string(),
        })
    }
}
