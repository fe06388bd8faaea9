//! Log sink selection.
//!
//! Foreground (`--nofork`) runs mirror `openlog(..., LOG_PERROR, ...)`:
//! logs go to stderr via `env_logger`. Daemonized runs mirror
//! `openlog(..., LOG_PID, LOG_DAEMON)`: logs go to syslog.

use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};

use crate::error::{Error, Result};

/// `--quiet` drops to warnings only, `--verbose` raises to debug,
/// `--debug` (with or without an explicit level) raises to trace -- same
/// precedence the original gives `quiet`/`verbose`/`debug`.
pub fn level_for(quiet: bool, verbose: bool, debug: Option<u32>) -> LevelFilter {
    if debug.is_some() {
        LevelFilter::Trace
    } else if verbose {
        LevelFilter::Debug
    } else if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    }
}

pub fn init(nofork: bool, level: LevelFilter) -> Result<()> {
    if nofork {
        env_logger::Builder::new().filter_level(level).init();
    } else {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: "mux2tty".into(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| Error::Misconfig(format!("failed to connect to syslog: {e}")))?;
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map_err(|e| Error::Misconfig(format!("failed to install syslog logger: {e}")))?;
        log::set_max_level(level);
    }
    Ok(())
}
