//! Dual per-object rebuild under section isolation flags.
//!
//! For every changed object the tree's compiled artifact is removed, the
//! unit is recompiled alone with each function and data item forced into
//! its own linker section, and the stripped result is staged per variant.
//! The orchestrator establishes the tree's patch state before each pass;
//! the two passes never interleave.

use std::fs;

use tokio::process::Command;

use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::models::{ArtifactKind, ChangeSet, SourceTree};
use crate::system;

/// Compiler flags that make per-symbol binary diffing possible.
pub const SECTION_ISOLATION_FLAGS: &str = "-ffunction-sections -fdata-sections";

pub struct DualTreeRebuilder<'a> {
    cfg: &'a BuildConfig,
}

impl<'a> DualTreeRebuilder<'a> {
    pub fn new(cfg: &'a BuildConfig) -> Self {
        DualTreeRebuilder { cfg }
    }

    /// Recompile every change-set member in the tree's current patch state
    /// and stage the stripped objects for `kind`. Any single object failing
    /// fails the pass; partial change sets are not supported.
    pub async fn rebuild_into(
        &self,
        tree: &SourceTree,
        changes: &ChangeSet,
        kind: ArtifactKind,
    ) -> Result<(), BuildError> {
        let staging = self.cfg.work_dir.join(kind.dir_name());
        fs::create_dir_all(&staging)?;

        log::info!("rebuilding {} {} object(s)", changes.len(), kind);
        for object in changes.iter() {
            let tree_object = tree.object(object);
            if tree_object.exists() {
                fs::remove_file(&tree_object)?;
            }

            let mut compile = Command::new("make");
            compile
                .arg(object)
                .env("KCFLAGS", SECTION_ISOLATION_FLAGS)
                .current_dir(&tree.root);
            system::run(compile).await?;

            if !tree_object.is_file() {
                return Err(BuildError::ArtifactMissing(tree_object));
            }

            let base = tree_object
                .file_name()
                .ok_or_else(|| BuildError::ArtifactMissing(tree_object.clone()))?;
            let staged = staging.join(base);
            fs::copy(&tree_object, &staged)?;

            // Debug info differs between otherwise identical builds; the
            // differencer only ever sees stripped objects.
            let mut strip = Command::new("strip");
            strip.arg("--strip-debug").arg(&staged);
            system::run(strip).await?;
        }
        Ok(())
    }
}
