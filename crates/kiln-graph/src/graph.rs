use kiln_model::{ChangeRecord, ChangeStatus};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

/// Extracts the dependency edges of one compilation unit from its content.
///
/// Analysis of different units is independent and runs in parallel; the
/// implementation must not rely on shared mutable state.
pub trait UnitAnalyzer: Send + Sync {
    /// Paths whose content this unit's rewrite depends on.
    fn dependencies_of(&self, unit: &Path) -> anyhow::Result<BTreeSet<PathBuf>>;
}

/// Directed dependency graph over compilation-unit paths.
///
/// An edge `A -> B` means A depends on B: when B changes, A must be
/// reprocessed. Units whose analysis failed are tracked separately as
/// always-stale and reprocessed on every incremental build until a successful
/// analysis replaces the marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// unit -> the units it depends on (outgoing edges).
    depends_on: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    /// unit -> the units that depend on it (reverse index of `depends_on`).
    dependents: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    always_stale: BTreeSet<PathBuf>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.depends_on.is_empty() && self.always_stale.is_empty()
    }

    pub fn contains(&self, unit: &Path) -> bool {
        self.depends_on.contains_key(unit)
    }

    /// Units that could not be analyzed; they must be treated as changed on
    /// every incremental invocation.
    pub fn always_stale(&self) -> &BTreeSet<PathBuf> {
        &self.always_stale
    }

    /// Rebuild the graph from scratch by analyzing every unit.
    ///
    /// Used when no persisted graph state exists or after an explicit
    /// invalidation.
    pub fn initialize_full(&mut self, units: &[PathBuf], analyzer: &dyn UnitAnalyzer) {
        self.depends_on.clear();
        self.dependents.clear();
        self.always_stale.clear();
        self.apply_analysis(analyze_parallel(units, analyzer));
    }

    /// Apply one invocation's changes and return the additional paths whose
    /// output became stale (transitive dependents of the changed set, the
    /// changed paths themselves excluded).
    ///
    /// Removed units are purged together with their outgoing edges; added and
    /// changed units get fresh edges from re-analysis. The affected set is
    /// computed against the edges recorded *before* the purge, so dependents of
    /// a removed unit are still reported.
    pub fn update_incremental(
        &mut self,
        changes: &[ChangeRecord],
        analyzer: &dyn UnitAnalyzer,
    ) -> BTreeSet<PathBuf> {
        let mut seeds = BTreeSet::new();
        let mut removed = Vec::new();
        let mut reanalyze = Vec::new();
        for change in changes {
            match change.status {
                ChangeStatus::Added | ChangeStatus::Changed => {
                    seeds.insert(change.path.clone());
                    reanalyze.push(change.path.clone());
                }
                ChangeStatus::Removed => {
                    seeds.insert(change.path.clone());
                    removed.push(change.path.clone());
                }
                ChangeStatus::Unchanged => {}
            }
        }

        let affected = self.affected_by(&seeds);

        for path in &removed {
            self.remove_unit(path);
        }
        self.apply_analysis(analyze_parallel(&reanalyze, analyzer));

        affected
    }

    /// All units transitively affected by a change to `paths`, following
    /// incoming ("is depended on by") edges. The seed paths themselves are
    /// excluded.
    pub fn affected_by(&self, paths: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<&Path> = paths.iter().map(PathBuf::as_path).collect();
        while let Some(path) = queue.pop_front() {
            let Some(dependents) = self.dependents.get(path) else {
                continue;
            };
            for dependent in dependents {
                if paths.contains(dependent) || !affected.insert(dependent.clone()) {
                    continue;
                }
                queue.push_back(dependent);
            }
        }
        affected
    }

    /// All paths whose content the output of `paths` may depend on, following
    /// outgoing edges transitively. The seed paths themselves are excluded.
    ///
    /// This is the read side of cache-key construction: every path returned
    /// here must contribute its content to the key of a task processing the
    /// seeds, otherwise a dependency edit hits a stale cache entry.
    pub fn dependency_closure(&self, paths: &BTreeSet<PathBuf>) -> BTreeSet<PathBuf> {
        let mut deps = BTreeSet::new();
        let mut queue: VecDeque<&Path> = paths.iter().map(PathBuf::as_path).collect();
        while let Some(path) = queue.pop_front() {
            let Some(targets) = self.depends_on.get(path) else {
                continue;
            };
            for target in targets {
                if paths.contains(target) || !deps.insert(target.clone()) {
                    continue;
                }
                queue.push_back(target);
            }
        }
        deps
    }

    fn apply_analysis(&mut self, results: Vec<(PathBuf, anyhow::Result<BTreeSet<PathBuf>>)>) {
        for (path, result) in results {
            match result {
                Ok(deps) => {
                    self.set_dependencies(path, deps);
                }
                Err(err) => {
                    // Conservative fallback: without edges we cannot tell what
                    // this unit is affected by, so reprocess it every build.
                    tracing::warn!(
                        target = "kiln.graph",
                        unit = %path.display(),
                        error = %err,
                        "dependency analysis failed; unit will be reprocessed on every build"
                    );
                    self.clear_outgoing_edges(&path);
                    self.depends_on.entry(path.clone()).or_default();
                    self.always_stale.insert(path);
                }
            }
        }
    }

    fn set_dependencies(&mut self, unit: PathBuf, deps: BTreeSet<PathBuf>) {
        self.clear_outgoing_edges(&unit);
        self.always_stale.remove(&unit);
        for dep in &deps {
            self.dependents.entry(dep.clone()).or_default().insert(unit.clone());
        }
        self.depends_on.insert(unit, deps);
    }

    /// Purge a unit's node and its outgoing edges. Edges *into* the unit are
    /// owned by the units that still reference it and are left in place until
    /// those units are re-analyzed.
    fn remove_unit(&mut self, unit: &Path) {
        self.clear_outgoing_edges(unit);
        self.depends_on.remove(unit);
        self.always_stale.remove(unit);
    }

    fn clear_outgoing_edges(&mut self, unit: &Path) {
        let Some(old_deps) = self.depends_on.get(unit).cloned() else {
            return;
        };
        for dep in old_deps {
            if let Some(dependents) = self.dependents.get_mut(&dep) {
                dependents.remove(unit);
                if dependents.is_empty() {
                    self.dependents.remove(&dep);
                }
            }
        }
    }
}

fn analyze_parallel(
    units: &[PathBuf],
    analyzer: &dyn UnitAnalyzer,
) -> Vec<(PathBuf, anyhow::Result<BTreeSet<PathBuf>>)> {
    units
        .par_iter()
        .map(|unit| (unit.clone(), analyzer.dependencies_of(unit)))
        .collect()
}
