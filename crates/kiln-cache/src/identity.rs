use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Resolves the logical identity string a path contributes to a cache key.
///
/// Absolute paths make poor cache-key material for artifacts that exist at
/// different locations on different machines (an archive exploded into a
/// staging area, a well-known generated file). An identity resolver decides,
/// per path, whether a location-independent identifier can be used instead.
pub trait IdentityResolver: Send + Sync {
    fn identity(&self, path: &Path) -> String;
}

/// Identity = the path itself, normalized. Suitable for caches that are never
/// shared across checkouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbsolutePathIdentity;

impl IdentityResolver for AbsolutePathIdentity {
    fn identity(&self, path: &Path) -> String {
        kiln_model::normalized_path_string(path)
    }
}

/// Maps paths under registered exploded-archive staging roots (and well-known
/// file names) to relative, location-independent identities so the same
/// logical artifact hits the same cache entry across machines and checkouts.
#[derive(Debug, Default)]
pub struct StagingIdentityResolver {
    staging_roots: Vec<PathBuf>,
    well_known_names: BTreeSet<String>,
}

impl StagingIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a directory under which archives are exploded. Paths below it
    /// are identified by their path relative to the root.
    pub fn add_staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_roots.push(root.into());
        self
    }

    /// Register a file name whose identity is the bare name, wherever the file
    /// lives (e.g. a generated runtime jar injected by the toolchain).
    pub fn add_well_known_name(mut self, name: impl Into<String>) -> Self {
        self.well_known_names.insert(name.into());
        self
    }
}

impl IdentityResolver for StagingIdentityResolver {
    fn identity(&self, path: &Path) -> String {
        for root in &self.staging_roots {
            if let Ok(rel) = path.strip_prefix(root) {
                return format!("staged/{}", kiln_model::normalized_path_string(rel));
            }
        }
        if let Some(name) = path.file_name() {
            let name = name.to_string_lossy();
            if self.well_known_names.contains(name.as_ref()) {
                return format!("known/{name}");
            }
        }
        kiln_model::normalized_path_string(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_paths_resolve_relative_to_their_root() {
        let resolver = StagingIdentityResolver::new()
            .add_staging_root("/home/a/.cache/exploded")
            .add_staging_root("/var/ci/exploded");

        let a = resolver.identity(Path::new("/home/a/.cache/exploded/lib-1.0/classes.jar"));
        let b = resolver.identity(Path::new("/var/ci/exploded/lib-1.0/classes.jar"));
        assert_eq!(a, b);
        assert_eq!(a, "staged/lib-1.0/classes.jar");
    }

    #[test]
    fn well_known_names_resolve_by_name() {
        let resolver = StagingIdentityResolver::new().add_well_known_name("runtime-deps.jar");
        assert_eq!(
            resolver.identity(Path::new("/tmp/build-1234/runtime-deps.jar")),
            "known/runtime-deps.jar"
        );
    }

    #[test]
    fn other_paths_fall_back_to_the_absolute_path() {
        let resolver = StagingIdentityResolver::new().add_staging_root("/exploded");
        assert_eq!(
            resolver.identity(Path::new("/work/project/out/classes.jar")),
            "/work/project/out/classes.jar"
        );
    }
}
