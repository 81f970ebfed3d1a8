//! Pipeline configuration, constructed once at startup.
//!
//! Everything the stages need to know about the host (running kernel release,
//! worker count) and the filesystem layout (cache, work dir, tool locations)
//! lives in one `BuildConfig` value passed down the pipeline. No stage reads
//! ambient process state on its own.

use std::env;
use std::path::PathBuf;

use crate::error::BuildError;
use crate::models::KernelRelease;
use crate::system;

/// Run log file name, created in the invocation directory.
pub const LOG_FILE_NAME: &str = "livepatch-build.log";

/// Environment override for the cache root.
pub const CACHEDIR_ENV: &str = "LIVEPATCH_CACHEDIR";
/// Environment override for the directory holding the external patch tools.
pub const TOOLSDIR_ENV: &str = "LIVEPATCH_TOOLSDIR";
/// Environment override for the module source skeleton directory.
pub const KMODDIR_ENV: &str = "LIVEPATCH_KMODDIR";

const DEFAULT_KMOD_DIR: &str = "/usr/local/share/livepatch-build/kmod";

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Release of the running kernel; cache key and build identifier.
    pub release: KernelRelease,
    /// Worker count for parallel build invocations.
    pub workers: usize,
    /// Root directory holding per-release trees and their archives.
    pub cache_root: PathBuf,
    /// Directory containing the external differencing/linking tools.
    /// When unset the tools are resolved through `PATH`.
    pub tools_dir: Option<PathBuf>,
    /// Directory containing the core and patch module source skeletons.
    pub kmod_dir: PathBuf,
    /// Invocation starting directory; final modules are copied here.
    pub output_dir: PathBuf,
    /// Run log path inside the invocation directory.
    pub log_path: PathBuf,
    /// Ephemeral per-run working directory; set by the orchestrator.
    pub work_dir: PathBuf,
}

impl BuildConfig {
    /// Probe the host and assemble the configuration for one run.
    pub fn detect(output_dir: PathBuf) -> Result<Self, BuildError> {
        let release = KernelRelease::new(system::capture_stdout("uname", &["-r"])?);
        let cache_root = env::var_os(CACHEDIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".livepatch-build")))
            .unwrap_or_else(|| PathBuf::from("/var/cache/livepatch-build"));
        let tools_dir = env::var_os(TOOLSDIR_ENV).map(PathBuf::from);
        let kmod_dir = env::var_os(KMODDIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KMOD_DIR));
        let log_path = output_dir.join(LOG_FILE_NAME);

        Ok(BuildConfig {
            release,
            workers: system::worker_count(),
            cache_root,
            tools_dir,
            kmod_dir,
            output_dir,
            log_path,
            work_dir: PathBuf::new(),
        })
    }

    /// Cached source tree directory for this release.
    pub fn tree_dir(&self) -> PathBuf {
        self.cache_root.join(format!("linux-{}", self.release))
    }

    /// Compressed cache archive for this release.
    pub fn archive_path(&self) -> PathBuf {
        self.cache_root.join(format!("linux-{}.tar.gz", self.release))
    }

    /// Resolve an external tool either inside `tools_dir` or via `PATH`.
    pub fn tool(&self, name: &str) -> PathBuf {
        match &self.tools_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }
}
