use crate::error::CacheError;
use crate::identity::IdentityResolver;
use kiln_hash::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Version of the cache key format itself.
///
/// Embedded in every key, so bumping it invalidates all previously committed
/// entries (used when the entry layout or field semantics change).
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// A typed cache-key field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Str(String),
    Bool(bool),
    Int(i64),
    Hash(Digest),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(v) => write!(f, "s:{v}"),
            FieldValue::Bool(v) => write!(f, "b:{v}"),
            FieldValue::Int(v) => write!(f, "i:{v}"),
            FieldValue::Hash(v) => write!(f, "h:{v}"),
        }
    }
}

/// Accumulates named, typed fields into a [`CacheKey`].
///
/// Fields are kept sorted by name, so the serialized key is independent of the
/// order in which call sites insert them. Inserting the same name twice is a
/// caller bug and fails rather than silently overwriting.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    command: String,
    fields: BTreeMap<String, FieldValue>,
}

impl CacheKeyBuilder {
    /// Start a key for one kind of cacheable command (e.g. `"predex-archive"`).
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn put_str(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<&mut Self, CacheError> {
        self.put(name.into(), FieldValue::Str(value.into()))
    }

    pub fn put_bool(&mut self, name: impl Into<String>, value: bool) -> Result<&mut Self, CacheError> {
        self.put(name.into(), FieldValue::Bool(value))
    }

    pub fn put_int(&mut self, name: impl Into<String>, value: i64) -> Result<&mut Self, CacheError> {
        self.put(name.into(), FieldValue::Int(value))
    }

    pub fn put_digest(
        &mut self,
        name: impl Into<String>,
        value: Digest,
    ) -> Result<&mut Self, CacheError> {
        self.put(name.into(), FieldValue::Hash(value))
    }

    /// Identify a file by logical identity plus content hash.
    ///
    /// This is the default identity rule: it is exact, but requires reading the
    /// file. The resolver decides whether the identity component is a
    /// location-independent identifier or the raw path.
    pub fn put_file_hash(
        &mut self,
        name: &str,
        path: &Path,
        resolver: &dyn IdentityResolver,
    ) -> Result<&mut Self, CacheError> {
        self.put(format!("{name}.id"), FieldValue::Str(resolver.identity(path)))?;
        self.put(format!("{name}.hash"), FieldValue::Hash(Digest::of_path(path)?))
    }

    /// Identify a file by logical identity plus size and mtime.
    ///
    /// Cheaper than [`Self::put_file_hash`] for very large archives, at the
    /// cost of spurious misses when a file is touched without content changes.
    pub fn put_file_stamp(
        &mut self,
        name: &str,
        path: &Path,
        resolver: &dyn IdentityResolver,
    ) -> Result<&mut Self, CacheError> {
        let meta = std::fs::metadata(path)?;
        let mtime_millis = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.put(format!("{name}.id"), FieldValue::Str(resolver.identity(path)))?;
        self.put(format!("{name}.length"), FieldValue::Int(meta.len() as i64))?;
        self.put(format!("{name}.timestamp"), FieldValue::Int(mtime_millis))
    }

    fn put(&mut self, name: String, value: FieldValue) -> Result<&mut Self, CacheError> {
        if self.fields.contains_key(&name) {
            return Err(CacheError::DuplicateField { name });
        }
        self.fields.insert(name, value);
        Ok(self)
    }

    pub fn build(self) -> CacheKey {
        CacheKey {
            command: self.command,
            format_version: CACHE_FORMAT_VERSION,
            fields: self.fields,
        }
    }
}

/// An immutable, versioned cache key.
///
/// Equal keys must imply equal outputs; every option or tool-version
/// difference that can change output must appear as a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    command: String,
    format_version: u32,
    fields: BTreeMap<String, FieldValue>,
}

impl CacheKey {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The digest of the key's canonical serialization; used as the entry's
    /// directory name under the cache root.
    pub fn digest(&self) -> Digest {
        Digest::of_bytes(self.describe().as_bytes())
    }

    /// Canonical, human-readable rendering of the key, one field per line.
    ///
    /// Stored verbatim next to each committed entry so collisions and
    /// unexpected misses can be diagnosed by diffing two dumps.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("command={}\n", self.command));
        out.push_str(&format!("format_version={}\n", self.format_version));
        for (name, value) in &self.fields {
            out.push_str(&format!("{name}={value}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AbsolutePathIdentity;

    #[test]
    fn field_order_does_not_affect_the_key() {
        let mut a = CacheKeyBuilder::new("predex");
        a.put_str("tool.version", "1.2.3").unwrap();
        a.put_bool("debuggable", true).unwrap();
        a.put_int("min_api", 21).unwrap();

        let mut b = CacheKeyBuilder::new("predex");
        b.put_int("min_api", 21).unwrap();
        b.put_bool("debuggable", true).unwrap();
        b.put_str("tool.version", "1.2.3").unwrap();

        let a = a.build();
        let b = b.build();
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.describe(), b.describe());
    }

    #[test]
    fn every_field_participates_in_the_digest() {
        let mut a = CacheKeyBuilder::new("predex");
        a.put_int("min_api", 21).unwrap();
        let mut b = CacheKeyBuilder::new("predex");
        b.put_int("min_api", 24).unwrap();
        assert_ne!(a.build().digest(), b.build().digest());

        let c = CacheKeyBuilder::new("predex").build();
        let d = CacheKeyBuilder::new("desugar").build();
        assert_ne!(c.digest(), d.digest());
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let mut builder = CacheKeyBuilder::new("predex");
        builder.put_str("tool.version", "1").unwrap();
        let err = builder.put_str("tool.version", "2").unwrap_err();
        assert!(matches!(err, CacheError::DuplicateField { .. }));
    }

    #[test]
    fn file_hash_fields_track_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib.jar");
        std::fs::write(&path, b"v1").unwrap();

        let mut a = CacheKeyBuilder::new("predex");
        a.put_file_hash("input", &path, &AbsolutePathIdentity).unwrap();
        let a = a.build();

        std::fs::write(&path, b"v2").unwrap();
        let mut b = CacheKeyBuilder::new("predex");
        b.put_file_hash("input", &path, &AbsolutePathIdentity).unwrap();
        assert_ne!(a.digest(), b.build().digest());
    }

    #[test]
    fn describe_lists_fields_sorted() {
        let mut builder = CacheKeyBuilder::new("predex");
        builder.put_str("b", "2").unwrap();
        builder.put_str("a", "1").unwrap();
        let dump = builder.build().describe();
        let a_at = dump.find("a=s:1").unwrap();
        let b_at = dump.find("b=s:2").unwrap();
        assert!(a_at < b_at);
        assert!(dump.starts_with("command=predex\n"));
    }
}
