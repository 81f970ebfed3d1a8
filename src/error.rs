//! Unified error type hierarchy for livepatch-build
//!
//! Provides structured error handling with BuildError, CacheError, PatchError,
//! DiffError, and AssembleError. The orchestrator and binary wrap these in
//! `anyhow` context at stage boundaries.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::models::ArtifactKind;

/// External command execution errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to spawn '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: io::Error,
    },

    #[error("'{cmd}' exited with {status}")]
    CommandFailed { cmd: String, status: ExitStatus },

    #[error("expected build artifact missing: {0}")]
    ArtifactMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Baseline source cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache archive {archive} holds release {found}, running kernel is {expected}")]
    ManifestMismatch {
        archive: PathBuf,
        found: String,
        expected: String,
    },

    #[error("cache manifest {0} is missing or unreadable")]
    ManifestUnreadable(PathBuf),

    #[error("no kernel configuration found for {0} (tried /proc/config.gz and /boot)")]
    ConfigMissing(String),

    #[error("baseline build left no vmlinux at {0}")]
    BaselineIncomplete(PathBuf),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Patch application and change detection errors.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("patch file {0} has no usable file name")]
    InvalidPatchFile(PathBuf),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Object pair differencing errors.
#[derive(Error, Debug)]
pub enum DiffError {
    #[error("no {kind} artifact for changed object {object}")]
    MissingCounterpart { object: String, kind: ArtifactKind },

    #[error("differencer produced no output for {0}")]
    OutputMissing(String),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Module assembly errors.
#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("module build produced no {0}")]
    ModuleMissing(PathBuf),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level result type for pipeline operations.
pub type Result<T> = anyhow::Result<T>;
