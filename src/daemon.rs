//! Daemonization and PID file lifecycle.
//!
//! Mirrors the original's double-fork/`setsid`/stdio-redirect sequence
//! (now via the `daemonize` crate) and its `/var/run/mux2tty.<tty
//! basename>.pid` convention, with removal wired to run on process exit
//! the way `on_exit(&remove_pid_file_on_exit, pidfn)` does.

use std::path::{Path, PathBuf};

use daemonize::Daemonize;

use crate::error::{Error, Result};

/// Returns the PID file path `/var/run/mux2tty.<basename(tty)>.pid` for
/// the given tty path, matching the original's `snprintf` convention.
pub fn pid_file_path(tty_path: &Path) -> PathBuf {
    let basename = tty_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    PathBuf::from(format!("/var/run/mux2tty.{basename}.pid"))
}

/// Forks into the background, redirects stdio to `/dev/null`, and writes
/// the PID file. Returns a guard whose `Drop` removes the PID file, giving
/// the same cleanup guarantee as the original's `on_exit` callback without
/// requiring the caller to remember to call anything on every exit path.
pub fn daemonize(pid_file: &Path) -> Result<PidFileGuard> {
    Daemonize::new()
        .pid_file(pid_file)
        .working_directory("/")
        .start()
        .map_err(|e| Error::Misconfig(format!("daemonization failed: {e}")))?;

    Ok(PidFileGuard {
        path: pid_file.to_path_buf(),
    })
}

pub struct PidFileGuard {
    path: PathBuf,
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        log::info!("removing pid file {}", self.path.display());
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("failed to remove pid file {}: {e}", self.path.display());
        }
    }
}
