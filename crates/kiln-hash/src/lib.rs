//! Stable content identity hashing for transform inputs.
//!
//! A [`Digest`] is the atomic unit of change detection: two inputs with equal
//! digests are treated as identical by the cache and the dependency graph, so
//! digests must be stable across processes and machines for identical content.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// A stable SHA-256 digest stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Compute the SHA-256 digest of an arbitrary byte slice.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute the SHA-256 digest of bytes read from `reader`.
    pub fn of_reader(mut reader: impl Read) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Compute the SHA-256 digest of a file's contents.
    ///
    /// Streams the file so large archives are never read into memory at once.
    pub fn of_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::of_reader(file)
    }

    /// Compute the identity digest of a path.
    ///
    /// Regular files are identified by their byte contents. Directories are
    /// identified by their canonical path string: their members are tracked as
    /// separate units, so recursively hashing a directory would double-count
    /// changes and make directory identity depend on enumeration cost.
    pub fn of_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        if meta.is_dir() {
            let canonical = std::fs::canonicalize(path)?;
            Ok(Self::of_bytes(canonical.to_string_lossy().as_bytes()))
        } else {
            Self::of_file(path)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short prefix suitable for embedding in file names.
    pub fn short(&self) -> &str {
        &self.0[..16.min(self.0.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A stable 64-bit hash of a string, derived from SHA-256.
///
/// Used for deterministic work partitioning; `std`'s `DefaultHasher` is
/// randomized per process and must not be used for anything persisted or
/// replayed across runs.
pub fn stable_hash64(value: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let bytes = hasher.finalize();
    u64::from_le_bytes(bytes[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_bytes_is_stable() {
        let a = Digest::of_bytes(b"hello");
        let b = Digest::of_bytes(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, Digest::of_bytes(b"other"));
    }

    #[test]
    fn file_digest_tracks_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("A.class");
        std::fs::write(&path, b"v1").unwrap();
        let first = Digest::of_path(&path).unwrap();
        assert_eq!(first, Digest::of_bytes(b"v1"));

        std::fs::write(&path, b"v2").unwrap();
        assert_ne!(first, Digest::of_path(&path).unwrap());
    }

    #[test]
    fn directory_digest_is_location_based() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("classes");
        std::fs::create_dir(&sub).unwrap();
        let before = Digest::of_path(&sub).unwrap();

        // Adding a member must not change the directory's identity.
        std::fs::write(sub.join("A.class"), b"x").unwrap();
        assert_eq!(before, Digest::of_path(&sub).unwrap());
    }

    #[test]
    fn missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Digest::of_path(dir.path().join("missing")).is_err());
    }

    #[test]
    fn stable_hash64_is_deterministic() {
        assert_eq!(stable_hash64("a/b/c"), stable_hash64("a/b/c"));
        assert_ne!(stable_hash64("a/b/c"), stable_hash64("a/b/d"));
    }
}
