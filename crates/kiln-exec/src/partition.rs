use kiln_hash::stable_hash64;
use kiln_model::{normalized_path_string, CompilationUnit};
use std::path::{Path, PathBuf};

/// One deterministic partition of an invocation's work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkBucket {
    pub id: usize,
    pub class_files: Vec<PathBuf>,
}

/// Bucket assignment for an archive unit, derived from its identity string.
///
/// A pure function of identity: repeated invocations route identical inputs to
/// identical buckets, which keeps output and cache directory layouts stable.
pub fn bucket_for_archive(unit: &CompilationUnit, total_buckets: usize) -> usize {
    debug_assert!(unit.is_archive());
    (stable_hash64(&unit.identity()) % total_buckets.max(1) as u64) as usize
}

/// Bucket assignment for a class file inside a directory unit.
///
/// Derived from the parent directory so files from the same package land in
/// the same bucket, preserving locality for the downstream tool.
pub fn bucket_for_class_file(class_file: &Path, total_buckets: usize) -> usize {
    let parent = class_file.parent().unwrap_or(class_file);
    (stable_hash64(&normalized_path_string(parent)) % total_buckets.max(1) as u64) as usize
}

/// Partition class files into `total_buckets` buckets.
///
/// Every bucket id is present in the result (possibly empty) so per-bucket
/// output locations stay addressable across runs; files within a bucket are
/// sorted so the result is independent of enumeration order.
pub fn partition_class_files(
    class_files: impl IntoIterator<Item = PathBuf>,
    total_buckets: usize,
) -> Vec<WorkBucket> {
    let total_buckets = total_buckets.max(1);
    let mut buckets: Vec<WorkBucket> = (0..total_buckets)
        .map(|id| WorkBucket {
            id,
            class_files: Vec::new(),
        })
        .collect();
    for file in class_files {
        let id = bucket_for_class_file(&file, total_buckets);
        buckets[id].class_files.push(file);
    }
    for bucket in &mut buckets {
        bucket.class_files.sort();
        bucket.class_files.dedup();
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::UnitKind;

    #[test]
    fn archive_buckets_are_stable() {
        let unit = CompilationUnit::new("/m2/guava-28.jar", UnitKind::Archive);
        let first = bucket_for_archive(&unit, 5);
        for _ in 0..10 {
            assert_eq!(bucket_for_archive(&unit, 5), first);
        }
        assert!(first < 5);
    }

    #[test]
    fn same_package_lands_in_the_same_bucket() {
        let a = bucket_for_class_file(Path::new("/out/com/example/A.class"), 8);
        let b = bucket_for_class_file(Path::new("/out/com/example/B.class"), 8);
        assert_eq!(a, b);
    }

    #[test]
    fn partition_is_independent_of_enumeration_order() {
        let files = vec![
            PathBuf::from("/out/com/a/One.class"),
            PathBuf::from("/out/com/b/Two.class"),
            PathBuf::from("/out/com/c/Three.class"),
            PathBuf::from("/out/com/a/Four.class"),
        ];
        let mut reversed = files.clone();
        reversed.reverse();

        assert_eq!(
            partition_class_files(files, 4),
            partition_class_files(reversed, 4)
        );
    }

    #[test]
    fn every_bucket_id_is_present() {
        let buckets = partition_class_files(vec![PathBuf::from("/out/A.class")], 6);
        assert_eq!(buckets.len(), 6);
        for (id, bucket) in buckets.iter().enumerate() {
            assert_eq!(bucket.id, id);
        }
        assert_eq!(
            buckets.iter().map(|b| b.class_files.len()).sum::<usize>(),
            1
        );
    }

    #[test]
    fn zero_buckets_degrades_to_one() {
        let unit = CompilationUnit::new("/m2/lib.jar", UnitKind::Archive);
        assert_eq!(bucket_for_archive(&unit, 0), 0);
    }
}
