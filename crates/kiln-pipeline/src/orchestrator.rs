use crate::resolve::{resolve_changes, ChangeSet};
use crate::PipelineError;
use anyhow::Context as _;
use kiln_cache::{ArtifactCache, CacheKey, CacheKeyBuilder, IdentityResolver, LockScope, QueryOutcome};
use kiln_exec::{bucket_for_archive, bucket_for_class_file, partition_class_files, WorkerPool};
use kiln_graph::{DependencyGraph, GraphStore, UnitAnalyzer};
use kiln_hash::Digest;
use kiln_model::{is_class_file, CompilationUnit, ToolConfig, TransformRequest};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The external tool invoked once per cache miss.
///
/// Must be idempotent: cache-miss recovery may invoke it again for the same
/// request. Implementations create their artifact (a file or a directory
/// tree) at exactly `request.output`.
pub trait UnitProcessor: Send + Sync {
    fn process(&self, request: &ProcessRequest) -> anyhow::Result<()>;
}

/// One unit of external-tool work.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub unit: CompilationUnit,
    pub bucket_id: usize,
    /// The class files assigned to this bucket; empty for archive units, which
    /// are processed whole.
    pub class_files: Vec<PathBuf>,
    /// Classpath context: paths outside this task's own inputs that the
    /// rewrite may read, taken from the dependency graph. Stable order.
    pub dependencies: Vec<PathBuf>,
    /// Where the artifact must be created.
    pub output: PathBuf,
}

/// Configuration for one transform session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root of the content-addressed artifact cache (shareable across
    /// variants and processes).
    pub cache_dir: PathBuf,
    /// Per-variant persisted dependency graph location.
    pub graph_state_path: PathBuf,
    /// Root for this transform's per-unit outputs.
    pub output_dir: PathBuf,
    pub bucket_count: usize,
    pub tool: ToolConfig,
    pub lock_scope: LockScope,
}

impl SessionConfig {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        graph_state_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        tool: ToolConfig,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            graph_state_path: graph_state_path.into(),
            output_dir: output_dir.into(),
            bucket_count: default_bucket_count(),
            tool,
            lock_scope: LockScope::MultiProcess,
        }
    }
}

/// Default fan-out, sized relative to the machine.
pub fn default_bucket_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .div_ceil(2)
        .clamp(1, 8)
}

/// Summary of one completed invocation.
#[derive(Debug, Default, Clone)]
pub struct TransformReport {
    /// Every path that was part of this invocation's work set (changed,
    /// graph-affected, always-stale, and explicitly requested paths).
    pub work_set: BTreeSet<PathBuf>,
    pub executed_tasks: usize,
    pub cache_hits: usize,
    pub cache_created: usize,
    pub cache_recovered: usize,
}

/// Coordinates change resolution, graph maintenance, partitioning, caching,
/// and parallel dispatch for one transform.
///
/// Explicitly constructed and lifetime-scoped: independent sessions (e.g.
/// different variants) can coexist in one process, sharing a [`WorkerPool`].
pub struct TransformSession {
    config: SessionConfig,
    pool: Arc<WorkerPool>,
    cache: ArtifactCache,
    graph_store: GraphStore,
    identity: Arc<dyn IdentityResolver>,
    analyzer: Arc<dyn UnitAnalyzer>,
    processor: Arc<dyn UnitProcessor>,
}

impl TransformSession {
    pub fn new(
        config: SessionConfig,
        pool: Arc<WorkerPool>,
        identity: Arc<dyn IdentityResolver>,
        analyzer: Arc<dyn UnitAnalyzer>,
        processor: Arc<dyn UnitProcessor>,
    ) -> Result<Self, PipelineError> {
        let cache = ArtifactCache::new(&config.cache_dir, config.lock_scope)?;
        let graph_store = GraphStore::new(&config.graph_state_path);
        std::fs::create_dir_all(&config.output_dir)?;
        Ok(Self {
            config,
            pool,
            cache,
            graph_store,
            identity,
            analyzer,
            processor,
        })
    }

    /// Run one transform invocation to completion.
    ///
    /// On failure nothing is committed for units still in flight: the
    /// dependency graph is only persisted after every task succeeded, and
    /// cache entries are committed per-unit, so entries from units that
    /// completed before the failure remain valid.
    pub fn run(&self, request: &TransformRequest) -> Result<TransformReport, PipelineError> {
        if request.incremental {
            self.run_incremental(request)
        } else {
            self.run_full(request)
        }
    }

    fn run_full(&self, request: &TransformRequest) -> Result<TransformReport, PipelineError> {
        tracing::info!(
            target = "kiln.pipeline",
            output = %self.config.output_dir.display(),
            "non-incremental invocation; invalidating graph state and prior outputs"
        );
        self.graph_store.invalidate()?;
        clear_dir(&self.config.output_dir)?;

        let mut graph = DependencyGraph::new();
        let mut tasks = Vec::new();
        let mut work_set = BTreeSet::new();
        let mut graph_nodes = Vec::new();

        let mut dir_files = Vec::new();
        for state in &request.units {
            let unit = &state.unit;
            if unit.is_archive() {
                graph_nodes.push(unit.path.clone());
                work_set.insert(unit.path.clone());
                continue;
            }
            let class_files = list_class_files(&unit.path)?;
            work_set.extend(class_files.iter().cloned());
            graph_nodes.extend(class_files.iter().cloned());
            dir_files.push((unit, class_files));
        }

        // Tasks are planned against the fresh graph so each one carries its
        // dependency context.
        graph.initialize_full(&graph_nodes, self.analyzer.as_ref());
        for state in &request.units {
            if state.unit.is_archive() {
                tasks.push(self.archive_task(&state.unit, &graph));
            }
        }
        for (unit, class_files) in dir_files {
            for bucket in partition_class_files(class_files, self.config.bucket_count) {
                if bucket.class_files.is_empty() {
                    continue;
                }
                tasks.push(self.dir_bucket_task(unit, bucket.id, bucket.class_files, &graph));
            }
        }
        self.dispatch(tasks, Vec::new(), &graph, work_set)
    }

    fn run_incremental(&self, request: &TransformRequest) -> Result<TransformReport, PipelineError> {
        let changes = resolve_changes(&request.units);

        let (graph, affected) = match self.graph_store.load()? {
            Some(mut graph) => {
                let affected = graph.update_incremental(&changes.records(), self.analyzer.as_ref());
                (graph, affected)
            }
            None => {
                tracing::info!(
                    target = "kiln.pipeline",
                    path = %self.graph_store.path().display(),
                    "no usable dependency graph state; running full analysis"
                );
                let mut graph = DependencyGraph::new();
                let mut nodes = Vec::new();
                for state in &request.units {
                    if state.unit.is_archive() {
                        nodes.push(state.unit.path.clone());
                    } else {
                        nodes.extend(list_class_files(&state.unit.path)?);
                    }
                }
                graph.initialize_full(&nodes, self.analyzer.as_ref());
                let affected = graph.affected_by(&changes.touched());
                (graph, affected)
            }
        };

        let mut dirty: BTreeSet<PathBuf> = changes.live();
        dirty.extend(affected);
        dirty.extend(request.additional_paths.iter().cloned());
        dirty.extend(graph.always_stale().iter().cloned());

        let (tasks, obsolete, work_set) = self.plan_incremental(request, &changes, &dirty, &graph)?;
        tracing::debug!(
            target = "kiln.pipeline",
            changed = changes.touched().len(),
            work = work_set.len(),
            tasks = tasks.len(),
            "resolved incremental work set"
        );
        self.dispatch(tasks, obsolete, &graph, work_set)
    }

    /// Translate the dirty path set into per-bucket tasks, plus outputs that
    /// must be deleted because their inputs no longer exist.
    fn plan_incremental(
        &self,
        request: &TransformRequest,
        changes: &ChangeSet,
        dirty: &BTreeSet<PathBuf>,
        graph: &DependencyGraph,
    ) -> Result<(Vec<Task>, Vec<PathBuf>, BTreeSet<PathBuf>), PipelineError> {
        let mut tasks = Vec::new();
        let mut obsolete = Vec::new();
        let mut work_set = BTreeSet::new();

        for state in &request.units {
            let unit = &state.unit;
            if unit.is_archive() {
                if changes.removed.contains(&unit.path) {
                    obsolete.push(self.unit_output_dir(unit));
                } else if dirty.contains(&unit.path) {
                    work_set.insert(unit.path.clone());
                    tasks.push(self.archive_task(unit, graph));
                }
                continue;
            }

            // A removed member forces its bucket to be rebuilt from the
            // directory's current contents even though the member itself is
            // gone.
            let mut dirty_buckets = BTreeSet::new();
            for path in dirty.iter().chain(changes.removed.iter()) {
                if is_class_file(path) && path.starts_with(&unit.path) {
                    dirty_buckets.insert(bucket_for_class_file(path, self.config.bucket_count));
                    work_set.insert(path.clone());
                }
            }
            if dirty_buckets.is_empty() {
                continue;
            }

            let current = list_class_files(&unit.path)?;
            let buckets = partition_class_files(current, self.config.bucket_count);
            for bucket in buckets {
                if !dirty_buckets.contains(&bucket.id) {
                    continue;
                }
                let output = self.bucket_output(unit, bucket.id);
                if bucket.class_files.is_empty() {
                    // Last member of the bucket was removed.
                    obsolete.push(output);
                } else {
                    tasks.push(self.dir_bucket_task(unit, bucket.id, bucket.class_files, graph));
                }
            }
        }

        Ok((tasks, obsolete, work_set))
    }

    fn dispatch(
        &self,
        tasks: Vec<Task>,
        obsolete: Vec<PathBuf>,
        graph: &DependencyGraph,
        work_set: BTreeSet<PathBuf>,
    ) -> Result<TransformReport, PipelineError> {
        for path in obsolete {
            remove_path(&path)?;
        }

        let counters = Arc::new(Counters::default());
        let mut batch = self.pool.batch();
        for task in tasks {
            let cache = self.cache.clone();
            let identity = Arc::clone(&self.identity);
            let processor = Arc::clone(&self.processor);
            let tool = self.config.tool.clone();
            let counters = Arc::clone(&counters);
            let bucket_count = self.config.bucket_count;
            batch.submit(move || {
                if !task.cacheable {
                    let Task {
                        unit,
                        bucket_id,
                        class_files,
                        dependencies,
                        output,
                        ..
                    } = task;
                    remove_path(&output)?;
                    if let Some(parent) = output.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    processor
                        .process(&ProcessRequest {
                            unit: unit.clone(),
                            bucket_id,
                            class_files,
                            dependencies,
                            output: output.clone(),
                        })
                        .with_context(|| {
                            format!(
                                "failed to process {} (bucket {bucket_id}, output {})",
                                unit.path.display(),
                                output.display()
                            )
                        })?;
                    counters.record_uncached();
                    return Ok(());
                }

                let key = task.cache_key(&tool, identity.as_ref(), bucket_count)?;
                let Task {
                    unit,
                    bucket_id,
                    class_files,
                    dependencies,
                    output,
                    ..
                } = task;
                let unit_path = unit.path.clone();
                let outcome = cache
                    .get_or_create(
                        &key,
                        |target| {
                            processor.process(&ProcessRequest {
                                unit: unit.clone(),
                                bucket_id,
                                class_files: class_files.clone(),
                                dependencies: dependencies.clone(),
                                output: target.to_path_buf(),
                            })
                        },
                        &output,
                    )
                    .with_context(|| {
                        format!(
                            "failed to process {} (bucket {bucket_id}, output {})",
                            unit_path.display(),
                            output.display()
                        )
                    })?;
                counters.record(outcome);
                Ok(())
            });
        }

        batch.wait(true)?;

        // All tasks succeeded; the graph state is now safe to persist.
        self.graph_store.save(graph)?;
        Ok(counters.into_report(work_set))
    }

    fn archive_task(&self, unit: &CompilationUnit, graph: &DependencyGraph) -> Task {
        let bucket_id = bucket_for_archive(unit, self.config.bucket_count);
        let seeds: BTreeSet<PathBuf> = std::iter::once(unit.path.clone()).collect();
        Task {
            unit: unit.clone(),
            bucket_id,
            class_files: Vec::new(),
            dependencies: graph.dependency_closure(&seeds).into_iter().collect(),
            output: self
                .unit_output_dir(unit)
                .join(format!("archive_{bucket_id}.jar")),
            // Project-local archives churn with every build; only external
            // ones earn shared cache entries.
            cacheable: unit.is_external(),
        }
    }

    fn dir_bucket_task(
        &self,
        unit: &CompilationUnit,
        bucket_id: usize,
        class_files: Vec<PathBuf>,
        graph: &DependencyGraph,
    ) -> Task {
        let seeds: BTreeSet<PathBuf> = class_files.iter().cloned().collect();
        Task {
            unit: unit.clone(),
            bucket_id,
            dependencies: graph.dependency_closure(&seeds).into_iter().collect(),
            class_files,
            output: self.bucket_output(unit, bucket_id),
            cacheable: true,
        }
    }

    /// Deterministic output root for a unit: name plus identity digest, so
    /// re-runs with the same configuration reuse the same paths and units with
    /// equal file names cannot collide.
    fn unit_output_dir(&self, unit: &CompilationUnit) -> PathBuf {
        let stem = unit
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unit".to_string());
        let digest = Digest::of_bytes(unit.identity().as_bytes());
        self.config
            .output_dir
            .join(format!("{stem}-{}", digest.short()))
    }

    fn bucket_output(&self, unit: &CompilationUnit, bucket_id: usize) -> PathBuf {
        self.unit_output_dir(unit).join(format!("bucket_{bucket_id}"))
    }
}

struct Task {
    unit: CompilationUnit,
    bucket_id: usize,
    class_files: Vec<PathBuf>,
    /// Dependency-graph closure of this task's inputs: paths outside the task
    /// whose content its output may depend on.
    dependencies: Vec<PathBuf>,
    output: PathBuf,
    cacheable: bool,
}

impl Task {
    /// Every input that can change this task's output becomes a key field,
    /// including the content of its graph dependencies; content hashing
    /// happens here, on the worker, not on the coordinating thread.
    fn cache_key(
        &self,
        tool: &ToolConfig,
        identity: &dyn IdentityResolver,
        bucket_count: usize,
    ) -> anyhow::Result<CacheKey> {
        let mut builder = if self.unit.is_archive() {
            let mut builder = CacheKeyBuilder::new("transform-archive");
            builder.put_file_hash("input", &self.unit.path, identity)?;
            builder
        } else {
            let mut builder = CacheKeyBuilder::new("transform-dir-bucket");
            builder.put_str("input.id", identity.identity(&self.unit.path))?;
            builder.put_int("bucket.id", self.bucket_id as i64)?;
            builder.put_int("bucket.count", bucket_count as i64)?;
            for (index, class_file) in self.class_files.iter().enumerate() {
                builder.put_file_hash(&format!("class.{index}"), class_file, identity)?;
            }
            builder
        };
        for (index, dep) in self.dependencies.iter().enumerate() {
            if dep.exists() {
                builder.put_file_hash(&format!("dep.{index}"), dep, identity)?;
            } else {
                // A vanished dependency still distinguishes the key from runs
                // where it was present.
                builder.put_str(format!("dep.{index}.id"), identity.identity(dep))?;
                builder.put_bool(format!("dep.{index}.removed"), true)?;
            }
        }
        builder.put_str("tool.version", &tool.tool_version)?;
        builder.put_int("tool.min_api", i64::from(tool.min_api_level))?;
        builder.put_bool("tool.debuggable", tool.debuggable)?;
        builder.put_str("tool.flags", tool.extra_flags.join("\u{1f}"))?;
        Ok(builder.build())
    }
}

#[derive(Default)]
struct Counters {
    executed: AtomicUsize,
    hits: AtomicUsize,
    created: AtomicUsize,
    recovered: AtomicUsize,
}

impl Counters {
    /// An executed task that bypassed the cache entirely.
    fn record_uncached(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, outcome: QueryOutcome) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            QueryOutcome::Hit => self.hits.fetch_add(1, Ordering::Relaxed),
            QueryOutcome::Created => self.created.fetch_add(1, Ordering::Relaxed),
            QueryOutcome::RecreatedAfterCorruption => {
                self.recovered.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    fn into_report(self: Arc<Self>, work_set: BTreeSet<PathBuf>) -> TransformReport {
        TransformReport {
            work_set,
            executed_tasks: self.executed.load(Ordering::Relaxed),
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_created: self.created.load(Ordering::Relaxed),
            cache_recovered: self.recovered.load(Ordering::Relaxed),
        }
    }
}

fn list_class_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            err.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walkdir error"))
        })?;
        if entry.file_type().is_file() && is_class_file(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }
    Ok(files)
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    std::fs::create_dir_all(dir)
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
