//! Run logging: one file per run, mirrored to stderr.
//!
//! Every `log::info!`/`warn!`/`error!` record goes to stderr and is appended
//! to the run log. Raw output lines from external commands are appended to
//! the same file without the stderr echo, so the log holds the complete
//! build transcript while the terminal only shows pipeline milestones.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

/// Shared handle to the run log for raw external-command output.
static RAW_LOG: OnceCell<Mutex<File>> = OnceCell::new();

struct RunLogger {
    file: Mutex<File>,
}

impl Log for RunLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] [{}] {}",
            Local::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.args()
        );
        // Debug records are file-only; the terminal gets milestones.
        if record.level() <= Level::Info {
            eprintln!("{}", line);
        }
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Create the run log (truncating any stale one from a previous run) and
/// install the global logger. Safe to call once per process.
pub fn init(log_path: &Path) -> io::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(log_path)?;
    let raw = file.try_clone()?;
    let _ = RAW_LOG.set(Mutex::new(raw));

    let logger = RunLogger {
        file: Mutex::new(file),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
    Ok(())
}

/// Append one raw external-command output line to the run log.
/// A no-op before `init`, so library consumers and tests need no setup.
pub fn append_raw(line: &str) {
    if let Some(file) = RAW_LOG.get() {
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}
