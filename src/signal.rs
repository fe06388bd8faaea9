//! SIGTERM handling.
//!
//! The original installs a handler that calls `restore_tty` and `exit(0)`
//! directly from signal context. We don't trust arbitrary code to run
//! safely inside a signal handler, so we only flip an `AtomicBool` there
//! (via `signal_hook::flag::register`, which is itself async-signal-safe)
//! and let the multiplex loop notice it at the top of the next iteration.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::{Error, Result};

pub fn install_term_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(Error::Io)?;
    Ok(flag)
}
