//! Content-addressed artifact cache and cache-key construction.
//!
//! The cache maps a [`CacheKey`] (an ordered, versioned set of named fields
//! describing every input that can affect an output) to a committed artifact on
//! disk. Entries are created at most once per key, are never mutated in place,
//! and are integrity-checked on every read.
//!
//! ## On-disk layout
//!
//! Under the cache root:
//! - `<key-digest>/payload`: the cached artifact (a file or a directory tree)
//! - `<key-digest>/manifest.json`: [`EntryManifest`] — checksums used for
//!   corruption detection
//! - `<key-digest>/inputs`: human-readable dump of the key fields, kept for
//!   diagnosing collisions
//! - `<key-digest>.lock`: lock file for cross-process exclusion
//! - `.staging/`: in-progress entries before their atomic rename into place

mod error;
mod identity;
mod key;
mod lock;
mod store;

pub use error::CacheError;
pub use identity::{AbsolutePathIdentity, IdentityResolver, StagingIdentityResolver};
pub use key::{CacheKey, CacheKeyBuilder, FieldValue, CACHE_FORMAT_VERSION};
pub use lock::{KeyLock, LockScope};
pub use store::{ArtifactCache, EntryManifest, QueryOutcome};

pub type Result<T> = std::result::Result<T, CacheError>;
