//! Core data structures shared across the pipeline stages.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PatchError;

/// Release string of the running kernel, as reported by `uname -r`.
///
/// The portion after the first `-` is the local version suffix; it has to be
/// written back into the baseline tree so the produced module's vermagic
/// matches the running kernel exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRelease(String);

impl KernelRelease {
    pub fn new(release: impl Into<String>) -> Self {
        KernelRelease(release.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Upstream version prefix, e.g. `6.6.8` for `6.6.8-200.fc39.x86_64`.
    pub fn base_version(&self) -> &str {
        self.0.split_once('-').map(|(base, _)| base).unwrap_or(&self.0)
    }

    /// Local version suffix including the leading `-`, empty when absent.
    pub fn local_version(&self) -> &str {
        self.0.find('-').map(|i| &self.0[i..]).unwrap_or("")
    }
}

impl fmt::Display for KernelRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The single input artifact: an absolute patch file path and its logical name.
#[derive(Debug, Clone)]
pub struct PatchSet {
    pub path: PathBuf,
    pub name: String,
}

impl PatchSet {
    /// Derive the logical name from the file name, stripping one trailing
    /// `.patch` or `.diff` suffix. `foo.patch`, `foo.diff` and `foo` all
    /// name the patch `foo`.
    pub fn new(path: PathBuf) -> Result<Self, PatchError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PatchError::InvalidPatchFile(path.clone()))?;
        let name = file_name
            .strip_suffix(".patch")
            .or_else(|| file_name.strip_suffix(".diff"))
            .unwrap_or(file_name)
            .to_string();
        Ok(PatchSet { path, name })
    }
}

/// A version-matched kernel source tree rooted inside the cache.
#[derive(Debug, Clone)]
pub struct SourceTree {
    pub root: PathBuf,
}

impl SourceTree {
    pub fn new(root: PathBuf) -> Self {
        SourceTree { root }
    }

    pub fn vmlinux(&self) -> PathBuf {
        self.root.join("vmlinux")
    }

    pub fn object(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }
}

/// Patch state of the shared source tree. The orchestrator owns the only
/// writer; stages assert the state they require before touching the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Clean,
    Patched,
}

/// Which side of an original/patched object pair an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Original,
    Patched,
}

impl ArtifactKind {
    /// Staging directory name inside the work dir.
    pub fn dir_name(&self) -> &'static str {
        match self {
            ArtifactKind::Original => "orig",
            ArtifactKind::Patched => "patched",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Original => f.write_str("original"),
            ArtifactKind::Patched => f.write_str("patched"),
        }
    }
}

/// Ordered, de-duplicated object paths affected by the patch, relative to
/// the source tree root. Order is discovery order from the rebuild log.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    objects: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn from_objects(objects: Vec<PathBuf>) -> Self {
        let mut seen = HashSet::new();
        let objects = objects
            .into_iter()
            .filter(|o| seen.insert(o.clone()))
            .collect();
        ChangeSet { objects }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.objects.iter()
    }

    /// One-line summary for the log.
    pub fn describe(&self) -> String {
        self.objects
            .iter()
            .map(|o| o.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The two final artifacts of a successful run.
#[derive(Debug, Clone)]
pub struct OutputModules {
    /// Patch-loader runtime module, independent of any specific patch.
    pub core: PathBuf,
    /// Per-patch module named after the patch set.
    pub patch: PathBuf,
}
