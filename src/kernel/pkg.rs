//! Package manager collaborator: kernel source retrieval and build deps.
//!
//! The pipeline never talks to a package database directly; it shells out to
//! the distribution tooling behind this narrow trait so tests can stub the
//! whole concern with fake executables on `PATH`.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::error::BuildError;
use crate::models::KernelRelease;
use crate::system;

#[allow(async_fn_in_trait)]
pub trait PackageManager {
    /// Install the build dependencies of the kernel package.
    async fn install_build_deps(&self, release: &KernelRelease) -> Result<(), BuildError>;

    /// Download and unpack the source package matching `release` under
    /// `staging`, returning the root of the prepared source tree.
    async fn fetch_and_unpack(
        &self,
        release: &KernelRelease,
        staging: &Path,
    ) -> Result<PathBuf, BuildError>;
}

/// RPM-based implementation: source rpm download, install and prep.
pub struct RpmPackageManager;

impl PackageManager for RpmPackageManager {
    async fn install_build_deps(&self, _release: &KernelRelease) -> Result<(), BuildError> {
        let mut cmd = Command::new("yum-builddep");
        cmd.arg("-y").arg("kernel");
        system::run(cmd).await
    }

    async fn fetch_and_unpack(
        &self,
        release: &KernelRelease,
        staging: &Path,
    ) -> Result<PathBuf, BuildError> {
        // Source packages are keyed by version-release without the trailing
        // architecture component of `uname -r`.
        let arch_suffix = format!(".{}", std::env::consts::ARCH);
        let verrel = release
            .as_str()
            .strip_suffix(&arch_suffix)
            .unwrap_or(release.as_str());

        let mut download = Command::new("yumdownloader");
        download
            .arg("--source")
            .arg("--destdir")
            .arg(staging)
            .arg(format!("kernel-{}", verrel));
        system::run(download).await?;

        let src_rpm = find_entry(staging, |name| name.ends_with(".src.rpm"))?;
        let topdir = staging.join("rpmbuild");

        let mut install = Command::new("rpm");
        install
            .arg("-D")
            .arg(format!("_topdir {}", topdir.display()))
            .arg("-ivh")
            .arg(&src_rpm);
        system::run(install).await?;

        let spec = topdir.join("SPECS").join("kernel.spec");
        let mut prep = Command::new("rpmbuild");
        prep.arg("-D")
            .arg(format!("_topdir {}", topdir.display()))
            .arg("-bp")
            .arg("--nodeps")
            .arg(&spec);
        system::run(prep).await?;

        // The prep stage leaves BUILD/kernel-*/linux-*; that inner tree is
        // the one the pipeline builds in.
        let build_dir = topdir.join("BUILD");
        let kernel_dir = find_entry(&build_dir, |name| name.starts_with("kernel-"))?;
        find_entry(&kernel_dir, |name| name.starts_with("linux-"))
    }
}

fn find_entry(dir: &Path, matches: impl Fn(&str) -> bool) -> Result<PathBuf, BuildError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if matches(name) {
                return Ok(entry.path());
            }
        }
    }
    Err(BuildError::ArtifactMissing(dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_entry_matches_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kernel-6.6.8-200.fc39.src.rpm"), b"rpm").unwrap();
        fs::write(dir.path().join("README"), b"noise").unwrap();

        let found = find_entry(dir.path(), |n| n.ends_with(".src.rpm")).unwrap();
        assert!(found.to_string_lossy().ends_with(".src.rpm"));
    }

    #[test]
    fn test_find_entry_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_entry(dir.path(), |n| n.ends_with(".src.rpm")).is_err());
    }
}
