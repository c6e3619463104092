//! Top-level transform orchestration.
//!
//! One [`TransformSession`] coordinates a single transform's lifecycle across
//! invocations: resolve reported changes, update the dependency graph, expand
//! the change set with graph-affected paths, partition the work into buckets,
//! and drive cache-backed processing on the worker pool.

mod orchestrator;
mod resolve;

pub use orchestrator::{
    ProcessRequest, SessionConfig, TransformReport, TransformSession, UnitProcessor,
};
pub use resolve::{resolve_changes, ChangeSet};

use kiln_cache::CacheError;
use kiln_exec::ExecError;
use kiln_graph::GraphError;

/// Errors surfaced by a transform invocation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("dependency graph state error: {0}")]
    Graph(#[from] GraphError),

    #[error("transform failed: {0}")]
    Exec(#[from] ExecError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
