//! Patch application and change-set detection.
//!
//! The patch is applied to the shared tree, the full baseline target is
//! rebuilt with every output line captured, and the capture is scraped for
//! compiler invocation records. Only the rebuild's exit status gates the
//! pipeline: the patch tool itself is allowed to report fuzz or partial
//! application without failing the run.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;

use crate::config::BuildConfig;
use crate::error::PatchError;
use crate::models::{ChangeSet, PatchSet, SourceTree};
use crate::system;

/// The build's own version stamp recompiles on every pass and never carries
/// a functional change; it must not enter the change set.
pub const VERSION_STAMP_OBJECT: &str = "init/version.o";

/// Capture file name for the rebuild transcript inside the work dir.
pub const CAPTURE_LOG: &str = "full-build.log";

static CC_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*CC\s+(?:\[M\]\s+)?(\S+\.o)\s*$").expect("invalid CC line regex")
});

/// Change detection strategy over the captured rebuild transcript.
/// Pluggable so the log scrape can later be swapped for build-system
/// dependency introspection without touching the rest of the pipeline.
pub trait ChangeDetection {
    fn detect(&self, build_log: &str) -> Vec<PathBuf>;
}

/// Default strategy: scrape compiler invocation lines from the transcript.
pub struct CompileLogScraper;

impl ChangeDetection for CompileLogScraper {
    fn detect(&self, build_log: &str) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        for line in build_log.lines() {
            if let Some(captures) = CC_LINE.captures(line) {
                let object = &captures[1];
                if object == VERSION_STAMP_OBJECT {
                    continue;
                }
                if seen.insert(object.to_string()) {
                    objects.push(PathBuf::from(object));
                }
            }
        }
        objects
    }
}

pub struct ChangeSetDetector<'a> {
    cfg: &'a BuildConfig,
}

impl<'a> ChangeSetDetector<'a> {
    pub fn new(cfg: &'a BuildConfig) -> Self {
        ChangeSetDetector { cfg }
    }

    /// Apply the patch to the tree. A non-zero exit from the patch tool is
    /// tolerated; the subsequent rebuild decides whether the tree is sound.
    pub async fn apply(&self, tree: &SourceTree, patch: &PatchSet) -> Result<(), PatchError> {
        log::info!("applying {}", patch.path.display());
        self.run_patch_tool(tree, patch, &["-N", "-p1"]).await
    }

    /// Revert the patch tree-wide, under the same exit-status policy.
    pub async fn revert(&self, tree: &SourceTree, patch: &PatchSet) -> Result<(), PatchError> {
        log::info!("reverting {}", patch.path.display());
        self.run_patch_tool(tree, patch, &["-R", "-p1"]).await
    }

    async fn run_patch_tool(
        &self,
        tree: &SourceTree,
        patch: &PatchSet,
        args: &[&str],
    ) -> Result<(), PatchError> {
        let input = fs::File::open(&patch.path)?;
        let mut cmd = Command::new("patch");
        cmd.args(args)
            .current_dir(&tree.root)
            .stdin(Stdio::from(input));
        system::run_tolerant(cmd).await?;
        Ok(())
    }

    /// Rebuild the full baseline target with the capture log attached and
    /// derive the change set from the transcript. An empty result is a
    /// valid terminal state, not an error.
    pub async fn rebuild_and_detect<D: ChangeDetection>(
        &self,
        tree: &SourceTree,
        strategy: &D,
    ) -> Result<ChangeSet, PatchError> {
        let capture = self.cfg.work_dir.join(CAPTURE_LOG);

        let mut cmd = Command::new("make");
        cmd.arg(format!("-j{}", self.cfg.workers))
            .arg("vmlinux")
            .current_dir(&tree.root);
        system::run_teed(cmd, &capture).await?;

        let transcript = fs::read_to_string(&capture)?;
        Ok(ChangeSet::from_objects(strategy.detect(&transcript)))
    }
}
