//! Command-line surface, matching the original's `argp` option table.

use std::path::PathBuf;

use clap::Parser;

use crate::delim::Buffering;
use crate::tty::BaudRate;

#[derive(Parser, Debug)]
#[command(
    name = "mux2tty",
    version,
    about = "Bridges one tty to many TCP clients with fair, record-framed I/O",
    long_about = "Data from TCP connections are sent to the tty. Data from the tty are \
sent to all TCP connections. By default, data are line-buffered and client writes to \
the tty are round-robined."
)]
pub struct Args {
    /// Path to the tty device to open.
    pub tty: PathBuf,

    /// Baud rate, positional form (overridden by --baud if both given).
    #[arg(default_value = "57600")]
    pub baud_positional: String,

    /// TCP port to listen on, positional form (overridden by --port).
    #[arg(default_value = "4660")]
    pub port_positional: String,

    /// Turn on debugging; an optional level selects verbosity.
    #[arg(short = 'd', long, num_args = 0..=1, default_missing_value = "4294967295")]
    pub debug: Option<u32>,

    /// Don't fork or daemonize.
    #[arg(short = 'n', long)]
    pub nofork: bool,

    /// Be more verbose.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Be quiet.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Baud rate for the tty.
    #[arg(short = 'b', long)]
    pub baud: Option<String>,

    /// Enable hardware flow control.
    #[arg(short = 'f', long)]
    pub flowctrl: bool,

    /// Port number to listen on.
    #[arg(short = 'p', long)]
    pub port: Option<String>,

    /// Line buffering (the default).
    #[arg(short = 'l', long, conflicts_with = "tiu_buffering")]
    pub line_buffering: bool,

    /// TIU buffering (records delimited by 0x4D rather than newline).
    #[arg(short = 't', long)]
    pub tiu_buffering: bool,
}

impl Args {
    pub fn baud_string(&self) -> &str {
        self.baud.as_deref().unwrap_or(&self.baud_positional)
    }

    pub fn port_string(&self) -> &str {
        self.port.as_deref().unwrap_or(&self.port_positional)
    }

    pub fn resolved_baud(&self) -> crate::error::Result<BaudRate> {
        BaudRate::parse(self.baud_string())
    }

    pub fn resolved_port(&self) -> crate::error::Result<u16> {
        self.port_string().parse().map_err(|_| {
            crate::error::Error::Misconfig(format!(
                "port {:?} is not a valid port number",
                self.port_string()
            ))
        })
    }

    pub fn buffering(&self) -> Buffering {
        if self.tiu_buffering {
            Buffering::Tiu
        } else {
            Buffering::Line
        }
    }
}
