//! Deterministic work partitioning and the bounded worker pool.

mod executor;
mod partition;

pub use executor::{ExecError, TaskBatch, WorkerPool};
pub use partition::{bucket_for_archive, bucket_for_class_file, partition_class_files, WorkBucket};
