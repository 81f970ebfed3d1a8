//! Object pair differencing through the external differencer.
//!
//! The diff algorithm itself lives in an external executable with a fixed
//! file-path contract: original object, patched object, output path. This
//! module owns the per-pair iteration, the base-filename naming convention,
//! and the fail-fast behavior; the tool stays swappable and mockable.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::config::BuildConfig;
use crate::error::DiffError;
use crate::models::{ArtifactKind, ChangeSet};
use crate::system;

/// Delta staging directory name inside the work dir.
pub const DELTA_DIR: &str = "diffs";

#[allow(async_fn_in_trait)]
pub trait ObjectDiffer {
    async fn diff(
        &self,
        original: &Path,
        patched: &Path,
        output: &Path,
    ) -> Result<(), DiffError>;
}

/// Production differencer: the external `create-diff-object` executable.
pub struct CreateDiffObject {
    program: PathBuf,
}

impl CreateDiffObject {
    pub fn new(cfg: &BuildConfig) -> Self {
        CreateDiffObject {
            program: cfg.tool("create-diff-object"),
        }
    }
}

impl ObjectDiffer for CreateDiffObject {
    async fn diff(
        &self,
        original: &Path,
        patched: &Path,
        output: &Path,
    ) -> Result<(), DiffError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(original).arg(patched).arg(output);
        system::run(cmd).await?;
        Ok(())
    }
}

/// Diff every change-set member's staged pair into the delta directory.
/// Every member must have both variants staged; a missing counterpart or a
/// failing tool invocation aborts immediately.
pub async fn diff_all<D: ObjectDiffer>(
    cfg: &BuildConfig,
    changes: &ChangeSet,
    differ: &D,
) -> Result<Vec<PathBuf>, DiffError> {
    let orig_dir = cfg.work_dir.join(ArtifactKind::Original.dir_name());
    let patched_dir = cfg.work_dir.join(ArtifactKind::Patched.dir_name());
    let delta_dir = cfg.work_dir.join(DELTA_DIR);
    fs::create_dir_all(&delta_dir)?;

    let mut deltas = Vec::with_capacity(changes.len());
    for object in changes.iter() {
        let base = object
            .file_name()
            .ok_or_else(|| DiffError::OutputMissing(object.display().to_string()))?;
        let name = base.to_string_lossy().into_owned();

        let original = orig_dir.join(base);
        if !original.is_file() {
            return Err(DiffError::MissingCounterpart {
                object: name,
                kind: ArtifactKind::Original,
            });
        }
        let patched = patched_dir.join(base);
        if !patched.is_file() {
            return Err(DiffError::MissingCounterpart {
                object: name,
                kind: ArtifactKind::Patched,
            });
        }

        let output = delta_dir.join(base);
        differ.diff(&original, &patched, &output).await?;
        if !output.is_file() {
            return Err(DiffError::OutputMissing(name));
        }

        log::debug!("diffed {}", output.display());
        deltas.push(output);
    }
    Ok(deltas)
}
