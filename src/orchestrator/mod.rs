//! Pipeline orchestration: cache -> detect -> rebuild -> diff -> assemble.
//!
//! The orchestrator owns the ephemeral work dir, the run log lifecycle and
//! the source tree's patch state. The tree is a single piece of mutable
//! shared state with exactly one writer; the explicit Clean/Patched state
//! machine here replaces reliance on careful command ordering.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use tempfile::TempDir;

use crate::config::BuildConfig;
use crate::error::Result;
use crate::kernel::assemble::ModuleAssembler;
use crate::kernel::cache::SourceCache;
use crate::kernel::detect::{ChangeSetDetector, CompileLogScraper};
use crate::kernel::diff::{self, CreateDiffObject};
use crate::kernel::pkg::RpmPackageManager;
use crate::kernel::rebuild::DualTreeRebuilder;
use crate::models::{ArtifactKind, OutputModules, PatchSet, SourceTree, TreeState};

/// Terminal state of a successful run.
#[derive(Debug)]
pub enum Outcome {
    /// The patch produced no functional difference; no module was built.
    NoChange,
    /// Both modules were built and copied to the output directory.
    Built(OutputModules),
}

pub struct Pipeline {
    cfg: BuildConfig,
    patch: PatchSet,
    state: TreeState,
    work_dir: Option<TempDir>,
}

impl Pipeline {
    /// Create the pipeline with a fresh per-run work dir.
    pub fn new(mut cfg: BuildConfig, patch: PatchSet) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("livepatch-build.")
            .tempdir()
            .context("creating work directory")?;
        cfg.work_dir = work_dir.path().to_path_buf();
        Ok(Pipeline {
            cfg,
            patch,
            state: TreeState::Clean,
            work_dir: Some(work_dir),
        })
    }

    pub fn config(&self) -> &BuildConfig {
        &self.cfg
    }

    fn expect_state(&self, required: TreeState) -> Result<()> {
        anyhow::ensure!(
            self.state == required,
            "source tree is {:?} but this stage requires {:?}",
            self.state,
            required
        );
        Ok(())
    }

    /// Run the whole differential build. On failure the work dir and run
    /// log are left for `retain_for_postmortem`; on success both are gone
    /// and the modules (if any) sit in the output directory.
    pub async fn run(&mut self) -> Result<Outcome> {
        log::info!(
            "building live patch '{}' for kernel {}",
            self.patch.name,
            self.cfg.release
        );

        self.pre_clean()?;

        let cache = SourceCache::new(&self.cfg, RpmPackageManager);
        let tree = cache
            .acquire()
            .await
            .context("establishing baseline source tree")?;

        let detector = ChangeSetDetector::new(&self.cfg);
        self.expect_state(TreeState::Clean)?;
        detector
            .apply(&tree, &self.patch)
            .await
            .context("applying patch")?;
        self.state = TreeState::Patched;

        log::info!("rebuilding patched tree to discover changed objects");
        let changes = detector
            .rebuild_and_detect(&tree, &CompileLogScraper)
            .await
            .context("rebuilding patched tree")?;

        if changes.is_empty() {
            log::info!("patch produced no functional change; nothing to build");
            detector
                .revert(&tree, &self.patch)
                .await
                .context("reverting patch")?;
            self.state = TreeState::Clean;
            self.success_cleanup(&tree)?;
            return Ok(Outcome::NoChange);
        }
        log::info!("{} changed object(s): {}", changes.len(), changes.describe());

        let rebuilder = DualTreeRebuilder::new(&self.cfg);
        self.expect_state(TreeState::Patched)?;
        rebuilder
            .rebuild_into(&tree, &changes, ArtifactKind::Patched)
            .await
            .context("rebuilding patched objects")?;

        detector
            .revert(&tree, &self.patch)
            .await
            .context("reverting patch")?;
        self.state = TreeState::Clean;
        self.expect_state(TreeState::Clean)?;
        rebuilder
            .rebuild_into(&tree, &changes, ArtifactKind::Original)
            .await
            .context("rebuilding original objects")?;

        let differ = CreateDiffObject::new(&self.cfg);
        let deltas = diff::diff_all(&self.cfg, &changes, &differ)
            .await
            .context("diffing object pairs")?;

        let assembler = ModuleAssembler::new(&self.cfg);
        let modules = assembler
            .assemble(&tree, &self.patch, &deltas)
            .await
            .context("assembling modules")?;

        let delivered = self.copy_out(&modules)?;
        self.success_cleanup(&tree)?;
        Ok(Outcome::Built(delivered))
    }

    /// A run always starts from a clean slate: remove whatever a previous
    /// run (failed or not) may have left in the cache.
    fn pre_clean(&self) -> Result<()> {
        let tree_dir = self.cfg.tree_dir();
        if tree_dir.exists() {
            log::info!("removing leftover source tree {}", tree_dir.display());
            fs::remove_dir_all(&tree_dir).context("removing stale source tree")?;
        }
        let staging = self.cfg.cache_root.join("pkg-staging");
        if staging.exists() {
            fs::remove_dir_all(&staging).context("removing stale package staging")?;
        }
        Ok(())
    }

    fn copy_out(&self, modules: &OutputModules) -> Result<OutputModules> {
        fs::create_dir_all(&self.cfg.output_dir)?;
        let copy_one = |from: &PathBuf| -> Result<PathBuf> {
            let name = from
                .file_name()
                .with_context(|| format!("module path {} has no file name", from.display()))?;
            let to = self.cfg.output_dir.join(name);
            fs::copy(from, &to)
                .with_context(|| format!("copying {} to {}", from.display(), to.display()))?;
            Ok(to)
        };
        let core = copy_one(&modules.core)?;
        let patch = copy_one(&modules.patch)?;
        log::info!("wrote {} and {}", core.display(), patch.display());
        Ok(OutputModules { core, patch })
    }

    /// Success-path cleanup: drop the extracted tree (the archive stays),
    /// the work dir and the run log.
    fn success_cleanup(&mut self, tree: &SourceTree) -> Result<()> {
        if tree.root.exists() {
            fs::remove_dir_all(&tree.root).context("removing source tree")?;
        }
        if let Some(work_dir) = self.work_dir.take() {
            work_dir.close().context("removing work directory")?;
        }
        let _ = fs::remove_file(&self.cfg.log_path);
        Ok(())
    }

    /// Failure-path policy: keep the work dir and run log on disk for
    /// inspection. Returns (retained work dir, run log path).
    pub fn retain_for_postmortem(&mut self) -> (Option<PathBuf>, PathBuf) {
        let kept = self.work_dir.take().map(|dir| dir.keep());
        (kept, self.cfg.log_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KernelRelease;

    fn test_pipeline() -> Pipeline {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BuildConfig {
            release: KernelRelease::new("6.6.0-test"),
            workers: 1,
            cache_root: dir.path().join("cache"),
            tools_dir: None,
            kmod_dir: dir.path().join("kmod"),
            output_dir: dir.path().join("out"),
            log_path: dir.path().join("out/livepatch-build.log"),
            work_dir: PathBuf::new(),
        };
        let patch = PatchSet::new(PathBuf::from("/tmp/fix.patch")).unwrap();
        Pipeline::new(cfg, patch).unwrap()
    }

    #[test]
    fn test_pipeline_starts_clean() {
        let pipeline = test_pipeline();
        assert!(pipeline.expect_state(TreeState::Clean).is_ok());
        assert!(pipeline.expect_state(TreeState::Patched).is_err());
    }

    #[test]
    fn test_state_transition_gates_stages() {
        let mut pipeline = test_pipeline();
        pipeline.state = TreeState::Patched;
        assert!(pipeline.expect_state(TreeState::Patched).is_ok());
        assert!(pipeline.expect_state(TreeState::Clean).is_err());
    }

    #[test]
    fn test_work_dir_exists_until_retained() {
        let mut pipeline = test_pipeline();
        let work_dir = pipeline.config().work_dir.clone();
        assert!(work_dir.is_dir());

        let (kept, _log) = pipeline.retain_for_postmortem();
        let kept = kept.unwrap();
        assert_eq!(kept, work_dir);
        assert!(kept.is_dir());
        // Retained dirs are the caller's to remove.
        fs::remove_dir_all(kept).unwrap();
    }
}
