use crate::error::CacheError;
use crate::key::CacheKey;
use crate::lock::{KeyLock, LockScope};
use kiln_hash::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const MANIFEST_FILE: &str = "manifest.json";
const INPUTS_FILE: &str = "inputs";
const PAYLOAD_NAME: &str = "payload";
const STAGING_DIR: &str = ".staging";

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How a `get_or_create` request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// A valid entry existed; the producer was not invoked.
    Hit,
    /// No entry existed; the producer ran and the result was committed.
    Created,
    /// An entry existed but failed its integrity check; it was deleted and the
    /// producer re-ran. Callers should log a warning when they see this.
    RecreatedAfterCorruption,
}

/// Integrity record committed alongside every cache entry.
///
/// Maps payload-relative paths to content digests; a single-file payload uses
/// the empty relative path. Checked on every read, so a bit flip or a torn
/// write degrades to a recreated entry instead of propagating bad output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryManifest {
    pub format_version: u32,
    pub command: String,
    pub checksums: BTreeMap<String, Digest>,
}

/// A durable key → artifact store with atomic creation-on-miss.
///
/// Entries are committed by renaming a fully-written staging directory into
/// place, so a crash mid-create leaves no visible entry. For a given key, at
/// most one producer runs at a time across all threads (and, with
/// [`LockScope::MultiProcess`], across processes sharing the cache root);
/// concurrent requests for the same key block and then observe a hit.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
    scope: LockScope,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>, scope: LockScope) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, scope })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory this key's entry occupies once committed.
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.digest().as_str())
    }

    /// True when a committed (not necessarily valid) entry exists for `key`.
    pub fn exists(&self, key: &CacheKey) -> bool {
        self.entry_dir(key).join(MANIFEST_FILE).is_file()
    }

    /// Look up `key`; on miss (or corruption) run `producer` to materialize
    /// the artifact, commit it, then copy the cached artifact to `output`.
    ///
    /// `producer` receives the exact path at which it must create its artifact
    /// (a file or a directory tree). If it fails, nothing is committed and the
    /// error is surfaced wrapped with the cache directory path.
    pub fn get_or_create(
        &self,
        key: &CacheKey,
        producer: impl FnOnce(&Path) -> anyhow::Result<()>,
        output: &Path,
    ) -> Result<QueryOutcome, CacheError> {
        let resolved_output = resolve_for_overlap(output);
        let resolved_root = resolve_for_overlap(&self.root);
        if resolved_output.starts_with(&resolved_root) || resolved_root.starts_with(&resolved_output)
        {
            return Err(CacheError::OutputOverlapsCache {
                path: output.to_path_buf(),
                cache_dir: self.root.clone(),
            });
        }

        let digest = key.digest();
        let entry_dir = self.root.join(digest.as_str());
        let lock_path = self.root.join(format!("{}.lock", digest.as_str()));
        let _lock = KeyLock::acquire(&lock_path, self.scope)?;

        let payload = entry_dir.join(PAYLOAD_NAME);
        let mut corrupted = false;
        match self.check_entry(&entry_dir) {
            EntryState::Valid => {
                copy_path(&payload, output)?;
                return Ok(QueryOutcome::Hit);
            }
            EntryState::Corrupted => {
                tracing::warn!(
                    target = "kiln.cache",
                    entry = %entry_dir.display(),
                    command = key.command(),
                    "cache entry failed integrity check; deleting and recreating"
                );
                std::fs::remove_dir_all(&entry_dir)?;
                corrupted = true;
            }
            EntryState::Missing => {
                // A directory without a manifest is debris from an interrupted
                // commit path; clear it before staging a fresh entry.
                if entry_dir.exists() {
                    std::fs::remove_dir_all(&entry_dir)?;
                }
            }
        }

        let staging = self.create_staging_dir(digest.as_str())?;
        let staged_payload = staging.join(PAYLOAD_NAME);
        if let Err(source) = producer(&staged_payload) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(CacheError::Producer {
                cache_dir: self.root.clone(),
                source,
            });
        }
        if !staged_payload.exists() {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(CacheError::Producer {
                cache_dir: self.root.clone(),
                source: anyhow::anyhow!(
                    "producer completed without creating {}",
                    staged_payload.display()
                ),
            });
        }

        let manifest = EntryManifest {
            format_version: crate::key::CACHE_FORMAT_VERSION,
            command: key.command().to_string(),
            checksums: payload_checksums(&staged_payload)?,
        };
        std::fs::write(
            staging.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        std::fs::write(staging.join(INPUTS_FILE), key.describe())?;

        std::fs::rename(&staging, &entry_dir)?;
        tracing::debug!(
            target = "kiln.cache",
            entry = %entry_dir.display(),
            command = key.command(),
            "committed cache entry"
        );

        copy_path(&payload, output)?;
        Ok(if corrupted {
            QueryOutcome::RecreatedAfterCorruption
        } else {
            QueryOutcome::Created
        })
    }

    fn check_entry(&self, entry_dir: &Path) -> EntryState {
        let manifest_path = entry_dir.join(MANIFEST_FILE);
        let bytes = match std::fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return EntryState::Missing,
            Err(_) => return EntryState::Corrupted,
        };
        let manifest: EntryManifest = match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(_) => return EntryState::Corrupted,
        };
        if manifest.format_version != crate::key::CACHE_FORMAT_VERSION {
            return EntryState::Corrupted;
        }

        let payload = entry_dir.join(PAYLOAD_NAME);
        let actual = match payload_checksums(&payload) {
            Ok(actual) => actual,
            Err(_) => return EntryState::Corrupted,
        };
        if actual == manifest.checksums {
            EntryState::Valid
        } else {
            EntryState::Corrupted
        }
    }

    fn create_staging_dir(&self, digest: &str) -> Result<PathBuf, CacheError> {
        let staging_root = self.root.join(STAGING_DIR);
        std::fs::create_dir_all(&staging_root)?;
        let pid = std::process::id();
        loop {
            let counter = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
            let candidate = staging_root.join(format!("{digest}.{pid}.{counter}"));
            match std::fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

enum EntryState {
    Valid,
    Missing,
    Corrupted,
}

/// Resolve symlinks for the output/cache overlap check by canonicalizing the
/// closest existing ancestor and re-appending the rest, since the output
/// itself usually does not exist yet.
fn resolve_for_overlap(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match std::fs::canonicalize(existing) {
            Ok(mut base) => {
                for part in suffix.iter().rev() {
                    base.push(part);
                }
                return base;
            }
            Err(_) => match existing.parent() {
                Some(parent) => {
                    if let Some(name) = existing.file_name() {
                        suffix.push(name.to_os_string());
                    }
                    existing = parent;
                }
                None => return path.to_path_buf(),
            },
        }
    }
}

/// Checksums for a payload file or directory tree, keyed by payload-relative
/// path ("" for a single-file payload).
fn payload_checksums(payload: &Path) -> std::io::Result<BTreeMap<String, Digest>> {
    let mut checksums = BTreeMap::new();
    let meta = std::fs::metadata(payload)?;
    if meta.is_file() {
        checksums.insert(String::new(), Digest::of_file(payload)?);
        return Ok(checksums);
    }

    for entry in walkdir::WalkDir::new(payload).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            err.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walkdir error"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(payload)
            .expect("walkdir yields paths under its root");
        checksums.insert(
            kiln_model::normalized_path_string(rel),
            Digest::of_file(entry.path())?,
        );
    }
    Ok(checksums)
}

/// Replace `dst` with a copy of `src` (file or directory tree).
fn copy_path(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(dst)?,
        Ok(_) => std::fs::remove_file(dst)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let meta = std::fs::metadata(src)?;
    if meta.is_file() {
        std::fs::copy(src, dst)?;
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|err| {
            err.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walkdir error"))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::CacheKeyBuilder;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn test_key(name: &str) -> CacheKey {
        let mut builder = CacheKeyBuilder::new("test");
        builder.put_str("input", name).unwrap();
        builder.build()
    }

    #[test]
    fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), LockScope::SingleProcess).unwrap();
        let out = dir.path().join("out/artifact.jar");
        let key = test_key("a");
        let runs = AtomicUsize::new(0);

        let outcome = cache
            .get_or_create(
                &key,
                |target| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    std::fs::write(target, b"artifact-bytes")?;
                    Ok(())
                },
                &out,
            )
            .unwrap();
        assert_eq!(outcome, QueryOutcome::Created);
        assert_eq!(std::fs::read(&out).unwrap(), b"artifact-bytes");
        assert!(cache.exists(&key));

        let outcome = cache
            .get_or_create(
                &key,
                |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    panic!("producer must not run on a hit");
                },
                &out,
            )
            .unwrap();
        assert_eq!(outcome, QueryOutcome::Hit);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&out).unwrap(), b"artifact-bytes");
    }

    #[test]
    fn directory_payloads_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), LockScope::SingleProcess).unwrap();
        let out = dir.path().join("out/dex");
        let key = test_key("dir");

        cache
            .get_or_create(
                &key,
                |target| {
                    std::fs::create_dir_all(target.join("com/example"))?;
                    std::fs::write(target.join("com/example/A.dex"), b"aa")?;
                    std::fs::write(target.join("classes.dex"), b"root")?;
                    Ok(())
                },
                &out,
            )
            .unwrap();
        assert_eq!(std::fs::read(out.join("com/example/A.dex")).unwrap(), b"aa");
        assert_eq!(std::fs::read(out.join("classes.dex")).unwrap(), b"root");

        let outcome = cache
            .get_or_create(&key, |_| unreachable!("cached"), &out)
            .unwrap();
        assert_eq!(outcome, QueryOutcome::Hit);
    }

    #[test]
    fn corrupted_entries_are_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), LockScope::SingleProcess).unwrap();
        let out = dir.path().join("out/artifact");
        let key = test_key("corrupt");
        let runs = AtomicUsize::new(0);
        let producer = |target: &Path| {
            runs.fetch_add(1, Ordering::SeqCst);
            std::fs::write(target, b"good").map_err(Into::into)
        };

        cache.get_or_create(&key, producer, &out).unwrap();
        std::fs::write(cache.entry_dir(&key).join(PAYLOAD_NAME), b"flipped-bits").unwrap();

        let outcome = cache.get_or_create(&key, producer, &out).unwrap();
        assert_eq!(outcome, QueryOutcome::RecreatedAfterCorruption);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(&out).unwrap(), b"good");

        // The recreated entry passes its integrity check again.
        let outcome = cache.get_or_create(&key, producer, &out).unwrap();
        assert_eq!(outcome, QueryOutcome::Hit);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_producer_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("cache");
        let cache = ArtifactCache::new(&cache_root, LockScope::SingleProcess).unwrap();
        let out = dir.path().join("out/artifact");
        let key = test_key("fails");

        let err = cache
            .get_or_create(&key, |_| Err(anyhow::anyhow!("tool exploded")), &out)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains(&cache_root.display().to_string()), "{message}");
        assert!(!cache.exists(&key));
        assert!(!cache.entry_dir(&key).exists());

        // The key is still usable after the failure.
        let outcome = cache
            .get_or_create(
                &key,
                |target| std::fs::write(target, b"ok").map_err(Into::into),
                &out,
            )
            .unwrap();
        assert_eq!(outcome, QueryOutcome::Created);
    }

    #[test]
    fn concurrent_requests_run_the_producer_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            ArtifactCache::new(dir.path().join("cache"), LockScope::MultiProcess).unwrap(),
        );
        let key = Arc::new(test_key("contended"));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = Arc::clone(&cache);
            let key = Arc::clone(&key);
            let runs = Arc::clone(&runs);
            let out = dir.path().join(format!("out/{i}"));
            handles.push(std::thread::spawn(move || {
                cache
                    .get_or_create(
                        &key,
                        |target| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            std::fs::write(target, b"shared").map_err(Into::into)
                        },
                        &out,
                    )
                    .unwrap();
                std::fs::read(&out).unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"shared");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn output_inside_cache_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), LockScope::SingleProcess).unwrap();
        let key = test_key("overlap");
        let inside = dir.path().join("cache/nested");

        let err = cache
            .get_or_create(&key, |_| unreachable!(), &inside)
            .unwrap_err();
        assert!(matches!(err, CacheError::OutputOverlapsCache { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_output_into_the_cache_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("cache"), LockScope::SingleProcess).unwrap();
        let link = dir.path().join("out-link");
        std::os::unix::fs::symlink(dir.path().join("cache"), &link).unwrap();

        let err = cache
            .get_or_create(&test_key("sym"), |_| unreachable!(), &link.join("nested"))
            .unwrap_err();
        assert!(matches!(err, CacheError::OutputOverlapsCache { .. }));
    }
}
