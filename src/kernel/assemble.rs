//! Final module assembly: core module, combined delta object, patch module.
//!
//! The module sources themselves are external collaborators (installed
//! skeletons with their own kernel-build Makefiles); this stage drives them
//! with the build-identifier, base-directory and patch-name variables, links
//! the deltas, and runs the external annotation and symbol-resolution tools.

use std::fs;
use std::path::PathBuf;

use tokio::process::Command;

use crate::config::BuildConfig;
use crate::error::AssembleError;
use crate::models::{OutputModules, PatchSet, SourceTree};
use crate::system;

/// File name of the patch-loader runtime module.
pub const CORE_MODULE: &str = "kpatch.ko";

/// Name of the combined relocatable delta object.
const COMBINED_OBJECT: &str = "output.o";

pub struct ModuleAssembler<'a> {
    cfg: &'a BuildConfig,
}

impl<'a> ModuleAssembler<'a> {
    pub fn new(cfg: &'a BuildConfig) -> Self {
        ModuleAssembler { cfg }
    }

    pub async fn assemble(
        &self,
        tree: &SourceTree,
        patch: &PatchSet,
        deltas: &[PathBuf],
    ) -> Result<OutputModules, AssembleError> {
        let core = self.build_core_module(tree).await?;
        let combined = self.link_deltas(deltas).await?;
        self.annotate(&combined, tree).await?;
        let module = self.build_patch_module(tree, patch, &combined).await?;
        Ok(OutputModules {
            core,
            patch: module,
        })
    }

    /// The core module depends only on the baseline tree, never on the
    /// specific patch.
    async fn build_core_module(&self, tree: &SourceTree) -> Result<PathBuf, AssembleError> {
        log::info!("building core module");
        let core_dir = self.cfg.kmod_dir.join("core");

        let mut clean = Command::new("make");
        clean.arg("-C").arg(&core_dir).arg("clean");
        system::run_tolerant(clean).await?;

        let mut build = Command::new("make");
        build
            .arg("-C")
            .arg(&core_dir)
            .env("KPATCH_BUILD", &tree.root);
        system::run(build).await?;

        let built = core_dir.join(CORE_MODULE);
        if !built.is_file() {
            return Err(AssembleError::ModuleMissing(built));
        }

        let staged = self.cfg.work_dir.join(CORE_MODULE);
        fs::copy(&built, &staged)?;
        Ok(staged)
    }

    async fn link_deltas(&self, deltas: &[PathBuf]) -> Result<PathBuf, AssembleError> {
        let combined = self.cfg.work_dir.join(COMBINED_OBJECT);
        let mut link = Command::new("ld");
        link.arg("-r").arg("-o").arg(&combined);
        for delta in deltas {
            link.arg(delta);
        }
        system::run(link).await?;
        if !combined.is_file() {
            return Err(AssembleError::ModuleMissing(combined));
        }
        Ok(combined)
    }

    /// Attach the patch metadata section, resolved against the baseline.
    async fn annotate(&self, combined: &PathBuf, tree: &SourceTree) -> Result<(), AssembleError> {
        let mut cmd = Command::new(self.cfg.tool("add-patches-section"));
        cmd.arg(combined).arg(tree.vmlinux());
        system::run(cmd).await?;
        Ok(())
    }

    async fn build_patch_module(
        &self,
        tree: &SourceTree,
        patch: &PatchSet,
        combined: &PathBuf,
    ) -> Result<PathBuf, AssembleError> {
        log::info!("building patch module kpatch-{}.ko", patch.name);
        let patch_dir = self.cfg.kmod_dir.join("patch");
        let core_dir = self.cfg.kmod_dir.join("core");

        // The patch module Makefile consumes the combined object from its
        // own directory.
        fs::copy(combined, patch_dir.join(COMBINED_OBJECT))?;

        let mut clean = Command::new("make");
        clean.arg("-C").arg(&patch_dir).arg("clean");
        system::run_tolerant(clean).await?;

        let mut build = Command::new("make");
        build
            .arg("-C")
            .arg(&patch_dir)
            .env("KPATCH_BASEDIR", &core_dir)
            .env("KPATCH_BUILD", &tree.root)
            .env("KPATCH_NAME", &patch.name);
        system::run(build).await?;

        let module_name = format!("kpatch-{}.ko", patch.name);
        let built = patch_dir.join(&module_name);
        if !built.is_file() {
            return Err(AssembleError::ModuleMissing(built));
        }

        let mut strip = Command::new("strip");
        strip.arg("--strip-debug").arg(&built);
        system::run(strip).await?;

        // Record the module's dependencies on the baseline symbol table.
        let mut resolve = Command::new(self.cfg.tool("link-vmlinux-syms"));
        resolve.arg(&built).arg(tree.vmlinux());
        system::run(resolve).await?;

        let staged = self.cfg.work_dir.join(&module_name);
        fs::copy(&built, &staged)?;
        Ok(staged)
    }
}
