use fs2::FileExt as _;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// How far the cache's mutual exclusion must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Only threads within this process touch the cache directory; an
    /// in-process mutex is sufficient and no lock files are created.
    SingleProcess,
    /// Multiple OS processes may share the cache directory; a filesystem lock
    /// is taken in addition to the in-process mutex.
    MultiProcess,
}

/// An exclusive lock guarding one cache entry.
///
/// Released when dropped. `fs2` file locks are process-scoped on Unix (they do
/// not exclude other threads of the same process), so an in-process mutex per
/// lock path is always held alongside the optional file lock.
#[derive(Debug)]
pub struct KeyLock {
    file: Option<File>,
    _guard: MutexGuard<'static, ()>,
}

impl KeyLock {
    /// Acquire an exclusive lock on `path`, creating the lockfile if needed.
    ///
    /// Blocks until the lock is available.
    pub fn acquire(path: &Path, scope: LockScope) -> std::io::Result<Self> {
        let mutex = process_lock_for_path(path);
        let guard = mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let file = match scope {
            LockScope::SingleProcess => None,
            LockScope::MultiProcess => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .read(true)
                    .write(true)
                    .open(path)?;
                file.lock_exclusive()?;
                Some(file)
            }
        };

        Ok(Self {
            file,
            _guard: guard,
        })
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.unlock();
        }
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lock_excludes_other_threads() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("entry.lock");
        let concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock_path = lock_path.clone();
            let concurrent = Arc::clone(&concurrent);
            handles.push(std::thread::spawn(move || {
                let _lock = KeyLock::acquire(&lock_path, LockScope::MultiProcess).unwrap();
                let inside = concurrent.fetch_add(1, Ordering::SeqCst);
                assert_eq!(inside, 0, "lock admitted two holders at once");
                std::thread::sleep(std::time::Duration::from_millis(5));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn single_process_scope_creates_no_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("entry.lock");
        let _lock = KeyLock::acquire(&lock_path, LockScope::SingleProcess).unwrap();
        assert!(!lock_path.exists());
    }
}
