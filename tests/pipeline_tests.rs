//! End-to-end pipeline tests against stubbed external tooling.
//!
//! Every external collaborator (make, patch, strip, ld, the differencing
//! and linking tools) is a tiny shell stub on PATH, so the whole
//! cache -> detect -> rebuild -> diff -> assemble sequence runs for real
//! without a kernel toolchain. Only `tar` is the real thing: the cache
//! genuinely archives and extracts the baseline tree.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tempfile::TempDir;

use livepatch_build::config::BuildConfig;
use livepatch_build::models::{KernelRelease, PatchSet};
use livepatch_build::orchestrator::{Outcome, Pipeline};

const RELEASE: &str = "6.6.0-test.x86_64";

const PATCH_TEXT: &str = "\
--- a/fs/ext4/balloc.c
+++ b/fs/ext4/balloc.c
@@ -1 +1 @@
-int ext4_balloc(void) { return 0; }
+int ext4_balloc(void) { return 1; }
";

const MAKE_STUB: &str = r#"#!/bin/sh
# make stand-in: emits compile records for the full build, fabricates
# objects for per-unit rebuilds, and fabricates modules in the kmod dirs.
dir="$(pwd)"
prev=""
for arg in "$@"; do
  if [ "$prev" = "-C" ]; then dir="$arg"; fi
  prev="$arg"
done
cd "$dir" || exit 1
case "$(basename "$dir")" in
  core) : > kpatch.ko ;;
  patch) : > "kpatch-${KPATCH_NAME:-unset}.ko" ;;
esac
for arg in "$@"; do
  case "$arg" in
    vmlinux)
      echo "  CC      init/version.o"
      if [ -f .emit-changes ]; then
        echo "  CC      fs/ext4/balloc.o"
      fi
      : > vmlinux
      ;;
    *.o)
      mkdir -p "$(dirname "$arg")"
      echo "object" > "$arg"
      ;;
  esac
done
exit 0
"#;

const PATCH_STUB: &str = "#!/bin/sh\ncat > /dev/null\nexit 0\n";

const STRIP_STUB: &str = "#!/bin/sh\nexit 0\n";

const LD_STUB: &str = r#"#!/bin/sh
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
done
if [ -n "$out" ]; then : > "$out"; fi
exit 0
"#;

const DIFF_STUB: &str = "#!/bin/sh\ncp \"$2\" \"$3\"\n";

const ANNOTATE_STUB: &str = "#!/bin/sh\n[ -f \"$1\" ] || exit 1\nexit 0\n";

const LINK_SYMS_STUB: &str = "#!/bin/sh\n[ -f \"$1\" ] || exit 1\nexit 0\n";

fn write_stub(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
}

/// Create the stub tool dir once per process and prepend it to PATH.
fn stub_tools() -> &'static Path {
    static STUBS: OnceLock<PathBuf> = OnceLock::new();
    STUBS
        .get_or_init(|| {
            let dir = tempfile::Builder::new()
                .prefix("livepatch-stub-tools.")
                .tempdir()
                .unwrap()
                .keep();
            write_stub(&dir, "make", MAKE_STUB);
            write_stub(&dir, "patch", PATCH_STUB);
            write_stub(&dir, "strip", STRIP_STUB);
            write_stub(&dir, "ld", LD_STUB);
            write_stub(&dir, "create-diff-object", DIFF_STUB);
            write_stub(&dir, "add-patches-section", ANNOTATE_STUB);
            write_stub(&dir, "link-vmlinux-syms", LINK_SYMS_STUB);

            let path = std::env::var("PATH").unwrap_or_default();
            std::env::set_var("PATH", format!("{}:{}", dir.display(), path));
            dir
        })
        .as_path()
}

/// Build a cache archive the way a previous successful run would have left
/// it: a built tree with a manifest, archived and then removed.
fn seed_archive(cache_root: &Path, release: &str, manifest_release: &str, emit_changes: bool) {
    fs::create_dir_all(cache_root).unwrap();
    let tree_name = format!("linux-{}", release);
    let tree = cache_root.join(&tree_name);
    fs::create_dir_all(tree.join("fs/ext4")).unwrap();
    fs::write(tree.join("vmlinux"), "baseline").unwrap();
    fs::write(
        tree.join("fs/ext4/balloc.c"),
        "int ext4_balloc(void) { return 0; }\n",
    )
    .unwrap();
    if emit_changes {
        fs::write(tree.join(".emit-changes"), "").unwrap();
    }
    fs::write(
        tree.join(".livepatch-manifest.json"),
        format!(
            "{{\n  \"release\": \"{}\",\n  \"created\": \"2026-08-04T00:00:00+00:00\"\n}}\n",
            manifest_release
        ),
    )
    .unwrap();

    let status = std::process::Command::new("tar")
        .arg("czf")
        .arg(cache_root.join(format!("{}.tar.gz", tree_name)))
        .arg("-C")
        .arg(cache_root)
        .arg(&tree_name)
        .status()
        .unwrap();
    assert!(status.success());
    fs::remove_dir_all(&tree).unwrap();
}

struct Fixture {
    _root: TempDir,
    cfg: BuildConfig,
    patch: PatchSet,
}

fn fixture(emit_changes: bool, manifest_release: &str) -> Fixture {
    stub_tools();

    let root = tempfile::tempdir().unwrap();
    let cache_root = root.path().join("cache");
    let output_dir = root.path().join("out");
    fs::create_dir_all(&output_dir).unwrap();
    let kmod_dir = root.path().join("kmod");
    fs::create_dir_all(kmod_dir.join("core")).unwrap();
    fs::create_dir_all(kmod_dir.join("patch")).unwrap();

    seed_archive(&cache_root, RELEASE, manifest_release, emit_changes);

    let patch_path = root.path().join("test-fix.patch");
    fs::write(&patch_path, PATCH_TEXT).unwrap();
    let patch = PatchSet::new(patch_path).unwrap();

    let cfg = BuildConfig {
        release: KernelRelease::new(RELEASE),
        workers: 1,
        cache_root,
        tools_dir: None,
        kmod_dir,
        output_dir: output_dir.clone(),
        log_path: output_dir.join("livepatch-build.log"),
        work_dir: PathBuf::new(),
    };

    Fixture {
        _root: root,
        cfg,
        patch,
    }
}

#[tokio::test]
async fn test_full_pipeline_builds_both_modules() {
    let f = fixture(true, RELEASE);
    let mut pipeline = Pipeline::new(f.cfg.clone(), f.patch.clone()).unwrap();

    let outcome = pipeline.run().await.unwrap();
    match outcome {
        Outcome::Built(modules) => {
            assert!(modules.core.is_file());
            assert!(modules.patch.is_file());
            assert_eq!(modules.core.file_name().unwrap(), "kpatch.ko");
            assert_eq!(modules.patch.file_name().unwrap(), "kpatch-test-fix.ko");
            assert_eq!(modules.core.parent().unwrap(), f.cfg.output_dir);
        }
        other => panic!("expected Built, got {:?}", other),
    }

    // The extracted tree is gone, the archive stays for the next run.
    assert!(!f.cfg.tree_dir().exists());
    assert!(f.cfg.archive_path().is_file());
    // Success removes the work dir.
    assert!(!pipeline.config().work_dir.exists());
}

#[tokio::test]
async fn test_no_functional_change_is_success_without_modules() {
    let f = fixture(false, RELEASE);
    let mut pipeline = Pipeline::new(f.cfg.clone(), f.patch.clone()).unwrap();

    let outcome = pipeline.run().await.unwrap();
    assert!(matches!(outcome, Outcome::NoChange));

    // No module reached the output directory.
    let modules: Vec<_> = fs::read_dir(&f.cfg.output_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "ko"))
        .collect();
    assert!(modules.is_empty());

    assert!(!f.cfg.tree_dir().exists());
    assert!(!pipeline.config().work_dir.exists());
}

#[tokio::test]
async fn test_rerun_reuses_cache_archive() {
    let f = fixture(true, RELEASE);

    let mut first = Pipeline::new(f.cfg.clone(), f.patch.clone()).unwrap();
    assert!(matches!(first.run().await.unwrap(), Outcome::Built(_)));

    // The second run can only succeed through the archive: no package
    // manager stubs exist, so a cache miss would fail to spawn them.
    let mut second = Pipeline::new(f.cfg.clone(), f.patch.clone()).unwrap();
    assert!(matches!(second.run().await.unwrap(), Outcome::Built(_)));
}

#[tokio::test]
async fn test_stale_archive_fails_and_retains_postmortem_state() {
    let f = fixture(true, "6.1.0-other.x86_64");
    let mut pipeline = Pipeline::new(f.cfg.clone(), f.patch.clone()).unwrap();

    let err = pipeline.run().await.unwrap_err();
    assert!(
        err.root_cause().to_string().contains("holds release"),
        "unexpected error: {:#}",
        err
    );

    // Failure keeps the extracted tree and the work dir for inspection.
    assert!(f.cfg.tree_dir().exists());
    let (kept, _log_path) = pipeline.retain_for_postmortem();
    let kept = kept.unwrap();
    assert!(kept.is_dir());
    fs::remove_dir_all(kept).unwrap();
}
