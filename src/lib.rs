//! livepatch-build: differential live-patch module builder.
//!
//! Builds a loadable kernel live-patch module pair from a unified source
//! patch against the kernel currently running on the host, without a
//! reboot. The pipeline establishes a cached version-matched baseline tree,
//! determines the compilation units the patch actually affects, rebuilds
//! them under section isolation flags in both patch states, hands each
//! original/patched pair to the external binary differencer, and assembles
//! the deltas into the core and patch modules.
//!
//! The system is organized into functional modules:
//! - **error**: unified error type hierarchy
//! - **models**: core data structures and types
//! - **config**: per-run configuration, constructed once at startup
//! - **logging**: run log with stderr mirroring
//! - **system**: external command execution and output streaming
//! - **kernel**: the pipeline stages (cache, detect, rebuild, diff, assemble)
//! - **orchestrator**: stage sequencing, tree state and failure policy

pub mod config;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod system;

// Re-export the log crate for macro usage
pub use log;

// Re-export error types for easy access
pub use error::{AssembleError, BuildError, CacheError, DiffError, PatchError, Result};

// Re-export model types for easy access
pub use models::{
    ArtifactKind, ChangeSet, KernelRelease, OutputModules, PatchSet, SourceTree, TreeState,
};

// Re-export the configuration and pipeline entry points
pub use config::BuildConfig;
pub use orchestrator::{Outcome, Pipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
