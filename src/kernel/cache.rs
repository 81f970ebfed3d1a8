//! Versioned baseline source cache.
//!
//! One fully built, version-matched source tree per kernel release, restored
//! from a compressed archive on every run. The expensive path (package
//! retrieval, configuration, full baseline build) runs at most once per
//! release; every later run extracts the archive and goes straight to
//! change detection.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::BuildConfig;
use crate::error::{BuildError, CacheError};
use crate::models::{KernelRelease, SourceTree};
use crate::system;

use super::pkg::PackageManager;

/// Manifest recorded inside the tree, carried into the archive. Lets a
/// cache hit verify that the archive actually matches the running kernel.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheManifest {
    pub release: String,
    pub created: String,
}

/// File name of the manifest inside the source tree.
pub const MANIFEST_FILE: &str = ".livepatch-manifest.json";

pub struct SourceCache<'a, P: PackageManager> {
    cfg: &'a BuildConfig,
    pkg: P,
}

impl<'a, P: PackageManager> SourceCache<'a, P> {
    pub fn new(cfg: &'a BuildConfig, pkg: P) -> Self {
        SourceCache { cfg, pkg }
    }

    /// Establish the baseline tree for the running release: extract the
    /// archive on a hit, otherwise build the baseline from the source
    /// package and archive it for the next run.
    pub async fn acquire(&self) -> Result<SourceTree, CacheError> {
        fs::create_dir_all(&self.cfg.cache_root)?;

        let tree_dir = self.cfg.tree_dir();
        let archive = self.cfg.archive_path();

        if archive.is_file() {
            log::info!("reusing cached baseline for {}", self.cfg.release);
            self.extract_archive(&archive).await?;
        } else {
            log::info!(
                "no cached baseline for {}; preparing one (this can take a while)",
                self.cfg.release
            );
            self.build_baseline(&tree_dir).await?;
            self.write_manifest(&tree_dir)?;
            self.create_archive(&archive, &tree_dir).await?;
        }

        self.verify_manifest(&tree_dir, &archive)?;

        let tree = SourceTree::new(tree_dir);
        if !tree.vmlinux().is_file() {
            return Err(CacheError::BaselineIncomplete(tree.vmlinux()));
        }
        Ok(tree)
    }

    async fn extract_archive(&self, archive: &Path) -> Result<(), CacheError> {
        let mut cmd = Command::new("tar");
        cmd.arg("xzf").arg(archive).arg("-C").arg(&self.cfg.cache_root);
        system::run(cmd).await?;
        Ok(())
    }

    async fn create_archive(&self, archive: &Path, tree_dir: &Path) -> Result<(), CacheError> {
        let dir_name = tree_dir
            .file_name()
            .ok_or_else(|| BuildError::ArtifactMissing(tree_dir.to_path_buf()))?;
        let mut cmd = Command::new("tar");
        cmd.arg("czf")
            .arg(archive)
            .arg("-C")
            .arg(&self.cfg.cache_root)
            .arg(dir_name);
        system::run(cmd).await?;
        log::info!("archived baseline to {}", archive.display());
        Ok(())
    }

    /// Cache miss path: fetch and unpack the source package, pin the build
    /// identifier to the running kernel, configure, and build `vmlinux`.
    async fn build_baseline(&self, tree_dir: &Path) -> Result<(), CacheError> {
        self.pkg.install_build_deps(&self.cfg.release).await?;

        let staging = self.cfg.cache_root.join("pkg-staging");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let src_root = self.pkg.fetch_and_unpack(&self.cfg.release, &staging).await?;
        fs::rename(&src_root, tree_dir)?;
        fs::remove_dir_all(&staging)?;

        // The local version suffix must match the running kernel exactly or
        // the produced module cannot bind to its symbol/version metadata.
        fs::write(
            tree_dir.join("localversion"),
            format!("{}\n", self.cfg.release.local_version()),
        )?;

        let config_text = running_config(&self.cfg.release)?;
        fs::write(
            tree_dir.join(".config"),
            disable_localversion_auto(&config_text),
        )?;

        let mut olddefconfig = Command::new("make");
        olddefconfig.arg("olddefconfig").current_dir(tree_dir);
        system::run(olddefconfig).await?;

        log::info!("building baseline vmlinux with {} workers", self.cfg.workers);
        let mut build = Command::new("make");
        build
            .arg(format!("-j{}", self.cfg.workers))
            .arg("vmlinux")
            .current_dir(tree_dir);
        system::run(build).await?;

        Ok(())
    }

    fn write_manifest(&self, tree_dir: &Path) -> Result<(), CacheError> {
        let manifest = CacheManifest {
            release: self.cfg.release.as_str().to_string(),
            created: chrono::Local::now().to_rfc3339(),
        };
        let path = tree_dir.join(MANIFEST_FILE);
        fs::write(&path, serde_json::to_string_pretty(&manifest).map_err(std::io::Error::from)?)?;
        Ok(())
    }

    fn verify_manifest(&self, tree_dir: &Path, archive: &Path) -> Result<(), CacheError> {
        let path = tree_dir.join(MANIFEST_FILE);
        let text =
            fs::read_to_string(&path).map_err(|_| CacheError::ManifestUnreadable(path.clone()))?;
        let manifest: CacheManifest =
            serde_json::from_str(&text).map_err(|_| CacheError::ManifestUnreadable(path))?;
        if manifest.release != self.cfg.release.as_str() {
            return Err(CacheError::ManifestMismatch {
                archive: archive.to_path_buf(),
                found: manifest.release,
                expected: self.cfg.release.as_str().to_string(),
            });
        }
        Ok(())
    }
}

/// Read the running kernel's configuration, preferring the in-kernel
/// gzipped copy over the boot-time snapshot.
fn running_config(release: &KernelRelease) -> Result<String, CacheError> {
    let proc_config = Path::new("/proc/config.gz");
    if proc_config.is_file() {
        let file = fs::File::open(proc_config)?;
        let mut decoder = GzDecoder::new(file);
        let mut text = String::new();
        decoder.read_to_string(&mut text)?;
        return Ok(text);
    }

    let boot_config = PathBuf::from(format!("/boot/config-{}", release));
    if boot_config.is_file() {
        return Ok(fs::read_to_string(boot_config)?);
    }

    Err(CacheError::ConfigMissing(release.as_str().to_string()))
}

/// Pin the local version to the `localversion` file alone: an auto-appended
/// scm suffix would break the exact match with the running kernel.
fn disable_localversion_auto(config: &str) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(config.lines().count() + 1);
    let mut seen = false;
    for line in config.lines() {
        if line.starts_with("CONFIG_LOCALVERSION_AUTO=") {
            lines.push("# CONFIG_LOCALVERSION_AUTO is not set".to_string());
            seen = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !seen && !config.contains("# CONFIG_LOCALVERSION_AUTO is not set") {
        lines.push("# CONFIG_LOCALVERSION_AUTO is not set".to_string());
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}
