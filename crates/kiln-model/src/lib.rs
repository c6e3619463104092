//! Shared data model for a single transform invocation.
//!
//! These types describe *what* a transform is asked to process; they carry no
//! behavior of their own. Everything here is immutable for the duration of one
//! invocation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// How a compilation unit is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    /// A directory of compiled `.class` files, tracked per member file.
    ClassesDir,
    /// A packaged archive (jar), tracked at whole-archive granularity.
    Archive,
}

/// Where a unit's content comes from, relative to the project being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    Project,
    SubProject,
    ExternalLibrary,
    TestedCode,
}

/// One processable input of a transform invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilationUnit {
    pub path: PathBuf,
    pub kind: UnitKind,
    pub scopes: BTreeSet<Scope>,
}

impl CompilationUnit {
    pub fn new(path: impl Into<PathBuf>, kind: UnitKind) -> Self {
        Self {
            path: path.into(),
            kind,
            scopes: BTreeSet::new(),
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scopes.insert(scope);
        self
    }

    pub fn is_archive(&self) -> bool {
        self.kind == UnitKind::Archive
    }

    /// A stable identity string for hashing and output naming.
    ///
    /// Backslashes are normalized so identities agree across platforms.
    pub fn identity(&self) -> String {
        normalized_path_string(&self.path)
    }

    /// True when this unit comes only from outside the current project tree.
    pub fn is_external(&self) -> bool {
        !self.scopes.is_empty() && self.scopes.iter().all(|s| *s == Scope::ExternalLibrary)
    }
}

/// Change status of a path relative to the previous invocation, as reported by
/// the surrounding build system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeStatus {
    Added,
    Changed,
    Removed,
    Unchanged,
}

impl ChangeStatus {
    pub fn is_change(self) -> bool {
        !matches!(self, ChangeStatus::Unchanged)
    }
}

/// A single reported path change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: PathBuf,
    pub status: ChangeStatus,
}

impl ChangeRecord {
    pub fn new(path: impl Into<PathBuf>, status: ChangeStatus) -> Self {
        Self {
            path: path.into(),
            status,
        }
    }
}

/// A compilation unit plus its reported change state for this invocation.
///
/// Archive units carry a single whole-archive status. Directory units carry
/// per-member records for the files the build system saw change; an empty
/// member list with `Unchanged` status means the directory is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitState {
    pub unit: CompilationUnit,
    pub status: ChangeStatus,
    pub member_changes: Vec<ChangeRecord>,
}

impl UnitState {
    pub fn archive(unit: CompilationUnit, status: ChangeStatus) -> Self {
        Self {
            unit,
            status,
            member_changes: Vec::new(),
        }
    }

    pub fn directory(unit: CompilationUnit, member_changes: Vec<ChangeRecord>) -> Self {
        let status = if member_changes.iter().any(|c| c.status.is_change()) {
            ChangeStatus::Changed
        } else {
            ChangeStatus::Unchanged
        };
        Self {
            unit,
            status,
            member_changes,
        }
    }
}

/// Tool-side configuration that can affect produced output.
///
/// Every field here participates in cache-key construction; omitting a field
/// that changes output is a correctness bug, not a cache-efficiency one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool_version: String,
    pub min_api_level: u32,
    pub debuggable: bool,
    pub extra_flags: Vec<String>,
}

impl ToolConfig {
    pub fn new(tool_version: impl Into<String>, min_api_level: u32) -> Self {
        Self {
            tool_version: tool_version.into(),
            min_api_level,
            debuggable: false,
            extra_flags: Vec::new(),
        }
    }
}

/// A full transform invocation as handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub units: Vec<UnitState>,
    pub incremental: bool,
    /// Extra paths to process on top of the resolved change set, regardless of
    /// their reported status.
    pub additional_paths: BTreeSet<PathBuf>,
}

impl TransformRequest {
    pub fn incremental(units: Vec<UnitState>) -> Self {
        Self {
            units,
            incremental: true,
            additional_paths: BTreeSet::new(),
        }
    }

    pub fn full(units: Vec<UnitState>) -> Self {
        Self {
            units,
            incremental: false,
            additional_paths: BTreeSet::new(),
        }
    }
}

/// True for compiled class files; resources living next to them in the same
/// directory are not compilation units and must not trigger reprocessing.
pub fn is_class_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "class")
}

/// A path rendered with forward slashes for platform-stable identities.
pub fn normalized_path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
