//! Dependency graph between compilation units.
//!
//! The graph records "affects" edges: if unit A depends on unit B, a change to
//! B makes A's previously produced output stale. Edges are re-derived from a
//! unit's content each time that unit is (re)analyzed, so the graph always
//! reflects the latest analyzed content for every unit still present.

mod graph;
mod persist;

pub use graph::{DependencyGraph, UnitAnalyzer};
pub use persist::{GraphStore, GRAPH_SCHEMA_VERSION};

use std::path::PathBuf;

/// Errors produced by graph persistence.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("graph state path {} has no parent directory", path.display())]
    NoParentDir { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, GraphError>;
