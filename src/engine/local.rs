//! Local Worker Pool
//!
//! Runs a job's partitions on a fixed number of tokio workers.
//!
//! ## Lifecycle
//! 1. **Submit**: every partition is encoded into a `PartitionTask` and queued.
//! 2. **Pull**: each worker pops the next task, decodes the partition and calls
//!    `compute` to get its lazy stream.
//! 3. **Run**: the user function consumes the stream and produces one result.
//! 4. **Join**: results are returned in partition order. The first failure
//!    aborts the remaining workers, which drops their in-flight requests.

use super::types::{JobId, Partition, PartitionTask, WorkerContext};
use crate::cluster::client::ClientProvider;
use crate::config::EngineSettings;
use crate::error::EngineError;

use futures::StreamExt;
use futures::stream::{BoxStream, FuturesUnordered};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

type WorkerOutput<T> = Result<Vec<(usize, T)>, EngineError>;

pub struct LocalEngine {
    workers: usize,
    clients: Arc<dyn ClientProvider>,
}

impl LocalEngine {
    pub fn new(workers: usize, clients: Arc<dyn ClientProvider>) -> Self {
        Self {
            workers: workers.max(1),
            clients,
        }
    }

    pub fn from_settings(settings: &EngineSettings, clients: Arc<dyn ClientProvider>) -> Self {
        Self::new(settings.workers, clients)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn clients(&self) -> Arc<dyn ClientProvider> {
        self.clients.clone()
    }

    /// Queues one task per partition and starts the workers. Returns at once.
    pub fn submit<P, F, Fut, T>(&self, partitions: Vec<P>, f: F) -> Result<JobHandle<T>, EngineError>
    where
        P: Partition,
        F: Fn(BoxStream<'static, P::Item>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let job_id = JobId::new();
        let tasks = partitions
            .iter()
            .map(|partition| PartitionTask::encode(&job_id, partition))
            .collect::<Result<VecDeque<_>, _>>()?;

        let task_count = tasks.len();
        let worker_count = self.workers.min(task_count);
        let queue = Arc::new(Mutex::new(tasks));
        let failed = Arc::new(AtomicBool::new(false));
        let f = Arc::new(f);

        tracing::debug!(
            "Job {} submitted: {} partitions on {} workers",
            job_id.0,
            task_count,
            worker_count
        );

        let workers: Vec<JoinHandle<WorkerOutput<T>>> = (0..worker_count)
            .map(|worker_id| {
                let ctx = WorkerContext {
                    worker_id,
                    clients: self.clients.clone(),
                };
                tokio::spawn(worker_loop::<P, F, Fut, T>(
                    ctx,
                    queue.clone(),
                    f.clone(),
                    failed.clone(),
                ))
            })
            .collect();

        let aborts = Arc::new(workers.iter().map(JoinHandle::abort_handle).collect());

        Ok(JobHandle {
            job_id,
            partitions: task_count,
            workers,
            canceller: JobCanceller {
                aborts,
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// Submits and waits for every partition.
    pub async fn run<P, F, Fut, T>(&self, partitions: Vec<P>, f: F) -> Result<Vec<T>, EngineError>
    where
        P: Partition,
        F: Fn(BoxStream<'static, P::Item>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(partitions, f)?.join().await
    }
}

async fn worker_loop<P, F, Fut, T>(
    ctx: WorkerContext,
    queue: Arc<Mutex<VecDeque<PartitionTask>>>,
    f: Arc<F>,
    failed: Arc<AtomicBool>,
) -> WorkerOutput<T>
where
    P: Partition,
    F: Fn(BoxStream<'static, P::Item>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut results = Vec::new();

    loop {
        if failed.load(Ordering::SeqCst) {
            break;
        }

        let Some(task) = queue.lock().await.pop_front() else {
            break;
        };

        tracing::trace!("Worker {} picked partition {}", ctx.worker_id, task.index);

        let outcome = match task.decode::<P>() {
            Ok(partition) => f(partition.compute(&ctx))
                .await
                .map_err(|source| EngineError::TaskFailed {
                    partition: task.index,
                    source,
                }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(value) => results.push((task.index, value)),
            Err(e) => {
                tracing::warn!("Worker {} failed on partition {}: {}", ctx.worker_id, task.index, e);
                failed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
    }

    Ok(results)
}

/// Cancels a running job from anywhere, e.g. while another task awaits `join`.
#[derive(Clone)]
pub struct JobCanceller {
    aborts: Arc<Vec<AbortHandle>>,
    cancelled: Arc<AtomicBool>,
}

impl JobCanceller {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        for handle in self.aborts.iter() {
            handle.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A running job.
pub struct JobHandle<T> {
    job_id: JobId,
    partitions: usize,
    workers: Vec<JoinHandle<WorkerOutput<T>>>,
    canceller: JobCanceller,
}

impl<T: Send + 'static> JobHandle<T> {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn canceller(&self) -> JobCanceller {
        self.canceller.clone()
    }

    /// Aborts every worker of the job. In-flight cluster requests are dropped.
    pub fn cancel(&self) {
        tracing::info!("Cancelling job {}", self.job_id.0);
        self.canceller.cancel();
    }

    /// Waits for all partitions and returns their results ordered by partition index.
    pub async fn join(self) -> Result<Vec<T>, EngineError> {
        let mut pending: FuturesUnordered<_> = self
            .workers
            .into_iter()
            .enumerate()
            .map(|(worker_id, handle)| async move { (worker_id, handle.await) })
            .collect();

        let mut results = Vec::with_capacity(self.partitions);
        while let Some((worker_id, joined)) = pending.next().await {
            let failure = match joined {
                Ok(Ok(values)) => {
                    results.extend(values);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) if e.is_cancelled() => EngineError::Cancelled,
                Err(_) => EngineError::WorkerPanicked(worker_id),
            };

            // The first failure wins; the rest of the job is torn down.
            for handle in self.canceller.aborts.iter() {
                handle.abort();
            }
            if self.canceller.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            return Err(failure);
        }

        if self.canceller.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        results.sort_by_key(|(index, _)| *index);
        tracing::debug!("Job {} finished ({} partitions)", self.job_id.0, results.len());
        Ok(results.into_iter().map(|(_, value)| value).collect())
    }
}
