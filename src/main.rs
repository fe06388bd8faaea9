use std::process::ExitCode;

use clap::Parser;

use mux2tty::cli::Args;
use mux2tty::error::Error;
use mux2tty::mux::{MultiplexLoop, ShutdownReason};
use mux2tty::{daemon, logging, net, signal, tty};

fn main() -> ExitCode {
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mux2tty: {e}");
            exit_code_for(&e)
        }
    }
}

/// One nonzero code per failure kind, mirroring the original's distinct
/// negative return codes per failure site (`mux2tty.c`'s `main` and
/// `start_mux_loop`), collapsed from per-call-site to per-`Error`-variant
/// granularity since that's what's observable through the `Result` chain.
fn exit_code_for(err: &Error) -> ExitCode {
    let code: u8 = match err {
        Error::Misconfig(_) => 64,
        Error::OutOfMemory { .. } => 71,
        Error::ShrinkBelowContent { .. } => 72,
        Error::NoSpace => 73,
        Error::Empty => 74,
        Error::Io(_) => 74,
        Error::Errno(_) => 74,
    };
    ExitCode::from(code)
}

fn run(args: Args) -> mux2tty::Result<()> {
    let level = logging::level_for(args.quiet, args.verbose, args.debug);
    logging::init(args.nofork, level)?;

    let baud = args.resolved_baud()?;
    let port = args.resolved_port()?;
    let buffering = args.buffering();

    let (tty_file, saved_termios) = tty::open_and_configure(&args.tty, baud, args.flowctrl)?;
    let tty_fd = {
        use std::os::unix::io::AsRawFd;
        tty_file.as_raw_fd()
    };

    log::info!(
        "terminal = {} ; baud = {} ; port = {port}",
        args.tty.display(),
        args.baud_string()
    );

    // The PID file guard must outlive daemonization and is only created
    // when actually forking, matching the original's behavior of never
    // writing one under --nofork.
    let _pid_guard = if !args.nofork {
        let pid_file = daemon::pid_file_path(&args.tty);
        Some(daemon::daemonize(&pid_file)?)
    } else {
        None
    };

    let term_flag = signal::install_term_flag()?;

    let listener = net::bind_listener(port)?;

    let mut mux = MultiplexLoop::new(tty_file, listener, buffering, term_flag)?;

    let reason = mux.run()?;
    match reason {
        ShutdownReason::TtyEof => log::info!("tty closed, exiting"),
        ShutdownReason::Signal => log::info!("captured sigterm, exiting"),
    }

    tty::restore(tty_fd, &saved_termios)?;

    Ok(())
}
