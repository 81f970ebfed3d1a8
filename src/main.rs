use std::path::PathBuf;
use std::process;

use clap::Parser;

use livepatch_build::config::BuildConfig;
use livepatch_build::logging;
use livepatch_build::models::PatchSet;
use livepatch_build::orchestrator::{Outcome, Pipeline};

#[derive(Parser)]
#[command(
    name = "livepatch-build",
    version,
    about = "Build a loadable live-patch module pair from a kernel source patch"
)]
struct Cli {
    /// Unified diff to turn into a live patch
    patch: PathBuf,
}

#[tokio::main]
async fn main() {
    // Usage errors exit with 2 before any side effect (clap's default).
    let cli = Cli::parse();

    if !cli.patch.is_file() {
        eprintln!("ERROR: patch file {} not found", cli.patch.display());
        process::exit(3);
    }
    // The patch is applied from inside the source tree; its path must
    // survive the directory change.
    let patch_path = match cli.patch.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("ERROR: patch file {} not usable: {}", cli.patch.display(), e);
            process::exit(3);
        }
    };
    let patch = match PatchSet::new(patch_path) {
        Ok(patch) => patch,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(3);
        }
    };

    let output_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("ERROR: cannot determine invocation directory: {}", e);
            process::exit(1);
        }
    };
    let cfg = match BuildConfig::detect(output_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = logging::init(&cfg.log_path) {
        eprintln!("ERROR: cannot create run log {}: {}", cfg.log_path.display(), e);
        process::exit(1);
    }

    let mut pipeline = match Pipeline::new(cfg, patch) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            process::exit(1);
        }
    };

    match pipeline.run().await {
        Ok(Outcome::Built(_)) => process::exit(0),
        Ok(Outcome::NoChange) => {
            log::info!("no binary differences found; no live patch needed");
            process::exit(0);
        }
        Err(e) => {
            log::error!("{:#}", e);
            let (work_dir, log_path) = pipeline.retain_for_postmortem();
            match work_dir {
                Some(dir) => eprintln!(
                    "ERROR: live patch build failed; see {} and {}",
                    log_path.display(),
                    dir.display()
                ),
                None => eprintln!(
                    "ERROR: live patch build failed; see {}",
                    log_path.display()
                ),
            }
            process::exit(1);
        }
    }
}
