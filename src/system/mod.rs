//! External command execution with output streaming into the run log.
//!
//! Every build step in the pipeline is an external command. They all funnel
//! through [`run`]/[`run_tolerant`] here so that stdout and stderr of each
//! tool end up, line by line, in the single run log, and failures carry the
//! rendered command line. [`run_teed`] additionally copies every line into a
//! dedicated capture file, which change detection later scrapes.

use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::BuildError;
use crate::logging;

/// Worker count for parallel build invocations: one per logical processor.
pub fn worker_count() -> usize {
    num_cpus::get()
}

/// Render a command line for logs and error messages.
pub fn render(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut rendered = std_cmd.get_program().to_string_lossy().into_owned();
    for arg in std_cmd.get_args() {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

/// Run a command to completion; non-zero exit is an error.
pub async fn run(cmd: Command) -> Result<(), BuildError> {
    let rendered = render(&cmd);
    let status = stream(cmd, &rendered, None).await?;
    if status.success() {
        Ok(())
    } else {
        Err(BuildError::CommandFailed {
            cmd: rendered,
            status,
        })
    }
}

/// Run a command whose exit status does not gate the pipeline; the caller
/// inspects the returned status. A non-zero exit is logged as a warning.
pub async fn run_tolerant(cmd: Command) -> Result<ExitStatus, BuildError> {
    let rendered = render(&cmd);
    let status = stream(cmd, &rendered, None).await?;
    if !status.success() {
        log::warn!("'{}' exited with {} (tolerated)", rendered, status);
    }
    Ok(status)
}

/// Run a command, teeing every output line into `capture` as well as the
/// run log. Non-zero exit is an error.
pub async fn run_teed(cmd: Command, capture: &Path) -> Result<(), BuildError> {
    let rendered = render(&cmd);
    let status = stream(cmd, &rendered, Some(capture)).await?;
    if status.success() {
        Ok(())
    } else {
        Err(BuildError::CommandFailed {
            cmd: rendered,
            status,
        })
    }
}

/// Capture trimmed stdout of a short probe command, e.g. `uname -r`.
pub fn capture_stdout(program: &str, args: &[&str]) -> Result<String, BuildError> {
    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .map_err(|e| BuildError::Spawn {
            cmd: program.to_string(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(BuildError::CommandFailed {
            cmd: program.to_string(),
            status: output.status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Spawn the command and drain stdout/stderr line by line into the run log
/// (and the optional capture file) until both streams close, then reap it.
async fn stream(
    mut cmd: Command,
    rendered: &str,
    capture: Option<&Path>,
) -> Result<ExitStatus, BuildError> {
    log::debug!("running: {}", rendered);

    let mut capture_file = match capture {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        ),
        None => None,
    };

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| BuildError::Spawn {
        cmd: rendered.to_string(),
        source: e,
    })?;

    let stdout = child.stdout.take().ok_or_else(|| BuildError::Spawn {
        cmd: rendered.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "stdout not captured"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| BuildError::Spawn {
        cmd: rendered.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "stderr not captured"),
    })?;

    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_closed = false;
    let mut stderr_closed = false;

    while !(stdout_closed && stderr_closed) {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_closed => {
                match line {
                    Ok(Some(line)) => sink_line(&line, capture_file.as_mut()),
                    Ok(None) => stdout_closed = true,
                    Err(e) => {
                        log::warn!("stdout read error from '{}': {}", rendered, e);
                        stdout_closed = true;
                    }
                }
            }
            line = stderr_lines.next_line(), if !stderr_closed => {
                match line {
                    Ok(Some(line)) => sink_line(&line, capture_file.as_mut()),
                    Ok(None) => stderr_closed = true,
                    Err(e) => {
                        log::warn!("stderr read error from '{}': {}", rendered, e);
                        stderr_closed = true;
                    }
                }
            }
        }
    }

    let status = child.wait().await?;
    log::debug!("'{}' exited with {}", rendered, status);
    Ok(status)
}

fn sink_line(line: &str, capture: Option<&mut std::fs::File>) {
    logging::append_raw(line);
    if let Some(file) = capture {
        let _ = writeln!(file, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_succeeds_for_true() {
        let cmd = Command::new("true");
        assert!(run(cmd).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_fails_for_false() {
        let cmd = Command::new("false");
        let err = run(cmd).await.unwrap_err();
        match err {
            BuildError::CommandFailed { cmd, .. } => assert_eq!(cmd, "false"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_run_tolerant_swallows_nonzero_exit() {
        let cmd = Command::new("false");
        let status = run_tolerant(cmd).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_run_teed_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("build.log");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo '  CC      fs/ext4/balloc.o'");
        run_teed(cmd, &capture).await.unwrap();

        let contents = std::fs::read_to_string(&capture).unwrap();
        assert!(contents.contains("CC      fs/ext4/balloc.o"));
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let cmd = Command::new("/nonexistent/definitely-not-a-tool");
        assert!(matches!(run(cmd).await, Err(BuildError::Spawn { .. })));
    }

    #[test]
    fn test_render_includes_args() {
        let mut cmd = Command::new("make");
        cmd.arg("-j4").arg("vmlinux");
        assert_eq!(render(&cmd), "make -j4 vmlinux");
    }

    #[test]
    fn test_capture_stdout_trims() {
        let out = capture_stdout("echo", &["6.6.0-test"]).unwrap();
        assert_eq!(out, "6.6.0-test");
    }
}
