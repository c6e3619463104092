use crate::graph::DependencyGraph;
use crate::GraphError;
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const GRAPH_SCHEMA_VERSION: u32 = 1;

/// Upper bound for a persisted graph payload.
///
/// Corrupted length prefixes must degrade to a full re-analysis, not an
/// enormous allocation.
const PAYLOAD_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Serialize, Deserialize)]
struct PersistedGraph {
    schema_version: u32,
    graph: DependencyGraph,
}

/// Durable storage for one variant's dependency graph.
///
/// The graph is owned by a single process per variant; there is no
/// cross-process writer protocol. Any unreadable or incompatible state loads
/// as "no graph", which forces the next invocation into a full re-analysis.
#[derive(Debug, Clone)]
pub struct GraphStore {
    path: PathBuf,
}

impl GraphStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted graph, or `None` when no usable state exists.
    pub fn load(&self) -> Result<Option<DependencyGraph>, GraphError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let persisted: PersistedGraph = match bincode_options().deserialize(&bytes) {
            Ok(persisted) => persisted,
            Err(err) => {
                tracing::warn!(
                    target = "kiln.graph",
                    path = %self.path.display(),
                    error = %err,
                    "persisted dependency graph is unreadable; forcing full re-analysis"
                );
                return Ok(None);
            }
        };
        if persisted.schema_version != GRAPH_SCHEMA_VERSION {
            tracing::info!(
                target = "kiln.graph",
                path = %self.path.display(),
                found = persisted.schema_version,
                expected = GRAPH_SCHEMA_VERSION,
                "persisted dependency graph has an incompatible schema; forcing full re-analysis"
            );
            return Ok(None);
        }
        Ok(Some(persisted.graph))
    }

    /// Persist `graph` atomically (write to a unique temp file, then rename).
    pub fn save(&self, graph: &DependencyGraph) -> Result<(), GraphError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| GraphError::NoParentDir {
                path: self.path.clone(),
            })?;
        std::fs::create_dir_all(parent)?;

        let persisted = PersistedGraph {
            schema_version: GRAPH_SCHEMA_VERSION,
            graph: graph.clone(),
        };
        let bytes = bincode_options().serialize(&persisted)?;

        let pid = std::process::id();
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = parent.join(format!(
            ".{}.tmp.{pid}.{counter}",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "graph".to_string())
        ));
        if let Err(err) = std::fs::write(&tmp, &bytes) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Drop all persisted graph state; the next load returns `None`.
    pub fn invalidate(&self) -> Result<(), GraphError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(PAYLOAD_LIMIT_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::UnitAnalyzer;
    use std::collections::BTreeSet;

    struct FixedAnalyzer;

    impl UnitAnalyzer for FixedAnalyzer {
        fn dependencies_of(&self, unit: &Path) -> anyhow::Result<BTreeSet<PathBuf>> {
            if unit == Path::new("A") {
                Ok([PathBuf::from("B")].into_iter().collect())
            } else {
                Ok(BTreeSet::new())
            }
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path().join("state/graph.bin"));
        assert!(store.load().unwrap().is_none());

        let mut graph = DependencyGraph::new();
        graph.initialize_full(&[PathBuf::from("A"), PathBuf::from("B")], &FixedAnalyzer);
        store.save(&graph).unwrap();

        let loaded = store.load().unwrap().expect("graph was saved");
        assert_eq!(loaded, graph);
    }

    #[test]
    fn unreadable_state_degrades_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.bin");
        std::fs::write(&path, b"not a graph").unwrap();

        let store = GraphStore::new(&path);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = GraphStore::new(dir.path().join("graph.bin"));
        store.invalidate().unwrap();

        let graph = DependencyGraph::new();
        store.save(&graph).unwrap();
        assert!(store.load().unwrap().is_some());

        store.invalidate().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
