use kiln_model::{is_class_file, ChangeRecord, ChangeStatus, UnitState};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// The minimal set of paths whose status changed since the previous
/// invocation, filtered to paths that are actually compilation units.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: BTreeSet<PathBuf>,
    pub changed: BTreeSet<PathBuf>,
    pub removed: BTreeSet<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Added and changed paths: everything that still exists and needs
    /// reprocessing on its own account.
    pub fn live(&self) -> BTreeSet<PathBuf> {
        self.added.union(&self.changed).cloned().collect()
    }

    /// Every touched path, including removals.
    pub fn touched(&self) -> BTreeSet<PathBuf> {
        self.live().union(&self.removed).cloned().collect()
    }

    /// The change set as records, for feeding the dependency graph.
    pub fn records(&self) -> Vec<ChangeRecord> {
        let mut records = Vec::new();
        for path in &self.added {
            records.push(ChangeRecord::new(path.clone(), ChangeStatus::Added));
        }
        for path in &self.changed {
            records.push(ChangeRecord::new(path.clone(), ChangeStatus::Changed));
        }
        for path in &self.removed {
            records.push(ChangeRecord::new(path.clone(), ChangeStatus::Removed));
        }
        records
    }

    fn insert(&mut self, path: PathBuf, status: ChangeStatus) {
        match status {
            ChangeStatus::Added => {
                self.added.insert(path);
            }
            ChangeStatus::Changed => {
                self.changed.insert(path);
            }
            ChangeStatus::Removed => {
                self.removed.insert(path);
            }
            ChangeStatus::Unchanged => {}
        }
    }
}

/// Derive the change set from the per-path statuses reported by the build
/// system.
///
/// Directory units contribute their changed member files, filtered to compiled
/// class files: a changed resource next to them is not a compilation unit and
/// must not trigger reprocessing. Archives are recorded at whole-archive
/// granularity; no attempt is made to diff inside them.
pub fn resolve_changes(units: &[UnitState]) -> ChangeSet {
    let mut set = ChangeSet::default();
    for state in units {
        if state.unit.is_archive() {
            set.insert(state.unit.path.clone(), state.status);
            continue;
        }
        for record in &state.member_changes {
            if is_class_file(&record.path) {
                set.insert(record.path.clone(), record.status);
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_model::{CompilationUnit, UnitKind};
    use std::path::Path;

    #[test]
    fn archives_are_whole_unit_granularity() {
        let jar = CompilationUnit::new("/m2/lib.jar", UnitKind::Archive);
        let set = resolve_changes(&[UnitState::archive(jar, ChangeStatus::Changed)]);
        assert!(set.changed.contains(Path::new("/m2/lib.jar")));
        assert!(set.added.is_empty() && set.removed.is_empty());
    }

    #[test]
    fn non_class_members_are_filtered_out() {
        let dir = CompilationUnit::new("/p/classes", UnitKind::ClassesDir);
        let set = resolve_changes(&[UnitState::directory(
            dir,
            vec![
                ChangeRecord::new("/p/classes/A.class", ChangeStatus::Changed),
                ChangeRecord::new("/p/classes/strings.xml", ChangeStatus::Changed),
                ChangeRecord::new("/p/classes/B.class", ChangeStatus::Removed),
            ],
        )]);
        assert_eq!(set.changed, [PathBuf::from("/p/classes/A.class")].into());
        assert_eq!(set.removed, [PathBuf::from("/p/classes/B.class")].into());
    }

    #[test]
    fn unchanged_units_produce_no_records() {
        let jar = CompilationUnit::new("/m2/lib.jar", UnitKind::Archive);
        let set = resolve_changes(&[UnitState::archive(jar, ChangeStatus::Unchanged)]);
        assert!(set.is_empty());
        assert!(set.records().is_empty());
    }
}
