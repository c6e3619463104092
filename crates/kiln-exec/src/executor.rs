use crossbeam_channel::{Receiver, Sender};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Failure of a task batch.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Quick-fail mode: the first task error, surfaced as-is.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    /// Drain mode: every task ran; all failures collected.
    #[error(
        "{} worker task(s) failed; first: {}",
        .errors.len(),
        .errors.first().map(|e| e.to_string()).unwrap_or_default()
    )]
    Aggregate { errors: Vec<anyhow::Error> },
}

enum PoolImpl {
    Rayon(rayon::ThreadPool),
    /// Fallback when no worker threads can be created: run jobs on the
    /// submitting thread. Preserves correctness at the cost of parallelism.
    Inline,
}

/// A shared, bounded-size worker pool for independent blocking tasks.
///
/// Reused across invocations and across concurrent orchestrators; sizing is
/// relative to the machine, not to any single invocation.
pub struct WorkerPool {
    inner: PoolImpl,
}

impl WorkerPool {
    /// Build a pool with `threads` workers, degrading to fewer threads (and
    /// ultimately to inline execution) when thread creation fails, e.g. under
    /// constrained CI thread limits.
    pub fn new(threads: usize) -> Self {
        let mut threads = threads.max(1);
        loop {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|idx| format!("kiln-worker-{idx}"))
                .build()
            {
                Ok(pool) => {
                    return Self {
                        inner: PoolImpl::Rayon(pool),
                    }
                }
                Err(_) if threads > 1 => {
                    threads = (threads / 2).max(1);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "kiln.exec",
                        error = %err,
                        "could not create any worker threads; falling back to inline execution"
                    );
                    return Self {
                        inner: PoolImpl::Inline,
                    };
                }
            }
        }
    }

    /// A pool sized for the current machine, capped to keep many concurrent
    /// build processes from exhausting OS thread limits.
    pub fn with_default_parallelism() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(available.saturating_sub(1).clamp(1, 8))
    }

    fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match &self.inner {
            PoolImpl::Rayon(pool) => pool.spawn(job),
            PoolImpl::Inline => job(),
        }
    }

    /// Start a new batch of tasks on this pool.
    pub fn batch(&self) -> TaskBatch<'_> {
        let (tx, rx) = crossbeam_channel::unbounded();
        TaskBatch {
            pool: self,
            tx,
            rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            submitted: 0,
        }
    }
}

/// A group of independent tasks whose completion is awaited together.
///
/// Tasks must not share mutable state without internal synchronization;
/// results flow back through the batch's channel, not through captured
/// variables.
pub struct TaskBatch<'a> {
    pool: &'a WorkerPool,
    tx: Sender<anyhow::Result<()>>,
    rx: Receiver<anyhow::Result<()>>,
    cancelled: Arc<AtomicBool>,
    submitted: usize,
}

impl TaskBatch<'_> {
    /// Enqueue a task. Panics inside the task are caught and reported as
    /// failures rather than poisoning the pool.
    pub fn submit(&mut self, task: impl FnOnce() -> anyhow::Result<()> + Send + 'static) {
        self.submitted += 1;
        let tx = self.tx.clone();
        let cancelled = Arc::clone(&self.cancelled);
        self.pool.spawn(move || {
            if cancelled.load(Ordering::Acquire) {
                // A quick-fail batch already observed a failure; skip.
                let _ = tx.send(Ok(()));
                return;
            }
            let result = match std::panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => result,
                Err(payload) => Err(anyhow::anyhow!(
                    "worker task panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };
            // The receiver may be gone when a quick-fail wait already
            // returned; late results are dropped on the floor.
            let _ = tx.send(result);
        });
    }

    /// Block until the batch completes.
    ///
    /// With `quick_fail`, the first failure is returned immediately as the
    /// original error; tasks that have not started yet are skipped, while
    /// already-running tasks finish in the background. Without it, every task
    /// runs and failures are aggregated.
    pub fn wait(self, quick_fail: bool) -> Result<(), ExecError> {
        drop(self.tx);
        let mut errors = Vec::new();
        for _ in 0..self.submitted {
            match self.rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if quick_fail {
                        self.cancelled.store(true, Ordering::Release);
                        return Err(ExecError::Failed(err));
                    }
                    errors.push(err);
                }
                // All senders dropped; nothing further can arrive.
                Err(_) => break,
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExecError::Aggregate { errors })
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
