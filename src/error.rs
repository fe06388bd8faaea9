//! Crate-wide error taxonomy.
//!
//! The multiplex loop never propagates these out of `run()` except for the
//! handful of cases spec'd as process-ending (`OutOfMemory` on session add,
//! `Misconfig` during startup validation). Everything else is logged and
//! turned into an internal state transition by the loop itself.

use std::io;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("allocation failed: {context}")]
    OutOfMemory { context: &'static str },

    #[error(
        "cannot shrink ring below its occupied content ({occupied} bytes held, {requested} requested)"
    )]
    ShrinkBelowContent { occupied: usize, requested: usize },

    #[error("ring buffer is full, no space for a nonblocking read")]
    NoSpace,

    #[error("ring buffer is empty, nothing to drain")]
    Empty,

    #[error("invalid configuration: {0}")]
    Misconfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system call failed: {0}")]
    Errno(#[from] nix::Error),
}
