//! Bridges one tty device to many concurrent TCP clients: broadcasting
//! tty reads verbatim to every connected client, and fairly
//! round-robin-arbitrating client writes back to the tty.

pub mod cli;
pub mod daemon;
pub mod delim;
pub mod error;
pub mod logging;
pub mod mux;
pub mod net;
pub mod ring;
pub mod session;
pub mod signal;
pub mod tty;

pub use error::{Error, Result};
