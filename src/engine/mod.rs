//! Local Compute Engine Module
//!
//! The parallel execution substrate the bridge runs on: a worker pool that
//! executes one task per partition, plus micro-batch streams for ingestion.
//!
//! ## Architecture Overview
//! - **Partitions are descriptions**: A `Partition` is serialized (bincode) into a
//!   `PartitionTask` on submission and decoded on the worker that runs it, so a
//!   partition can never smuggle a live connection to its worker.
//! - **Pull-based workers**: Workers pop tasks from a shared job queue until it is empty.
//! - **Cancellation**: `JobHandle::cancel` aborts every worker; dropping a partition's
//!   stream drops its in-flight request. A failing task aborts the rest of its job.
//!
//! ## Submodules
//! - **`types`**: `Partition`, `PartitionTask`, `WorkerContext`.
//! - **`local`**: `LocalEngine` and `JobHandle`.
//! - **`stream`**: `MicroBatchStream`, `BatchSender`, `queue_stream`.

pub mod local;
pub mod stream;
pub mod types;
