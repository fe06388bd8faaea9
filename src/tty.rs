//! Opening, configuring, and restoring the serial line.
//!
//! Mirrors `validate_terminal`/`restore_tty` in the original: stat the
//! path, open nonblocking, save the current `termios`, switch to raw
//! mode at the requested baud, and hand back both the open file and the
//! saved attributes so the caller can restore them on exit.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};
use std::path::Path;

use nix::sys::stat::stat;
use nix::sys::termios::{self, BaudRate as NixBaudRate, SetArg, SpecialCharacterIndices, Termios};

use crate::error::{Error, Result};

/// Baud rates accepted on the command line, matching the original's
/// `switch (baud)` table exactly (including the gaps -- e.g. no 100 or
/// 5000000 entry exists there either).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
    B0,
    B50,
    B75,
    B110,
    B134,
    B150,
    B200,
    B300,
    B600,
    B1200,
    B1800,
    B2400,
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
    B230400,
    B460800,
    B500000,
    B576000,
    B921600,
    B1000000,
    B1152000,
    B1500000,
    B2000000,
    B2500000,
    B3000000,
    B3500000,
    B4000000,
}

impl BaudRate {
    pub fn parse(raw: &str) -> Result<Self> {
        let n: u32 = raw
            .parse()
            .map_err(|_| Error::Misconfig(format!("baud rate {raw:?} is not a number")))?;
        Self::from_u32(n).ok_or_else(|| Error::Misconfig(format!("invalid baud rate {n}")))
    }

    fn from_u32(n: u32) -> Option<Self> {
        use BaudRate::*;
        Some(match n {
            0 => B0,
            50 => B50,
            75 => B75,
            110 => B110,
            134 => B134,
            150 => B150,
            200 => B200,
            300 => B300,
            600 => B600,
            1200 => B1200,
            1800 => B1800,
            2400 => B2400,
            4800 => B4800,
            9600 => B9600,
            19200 => B19200,
            38400 => B38400,
            57600 => B57600,
            115200 => B115200,
            230400 => B230400,
            460800 => B460800,
            500000 => B500000,
            576000 => B576000,
            921600 => B921600,
            1000000 => B1000000,
            1152000 => B1152000,
            1500000 => B1500000,
            2000000 => B2000000,
            2500000 => B2500000,
            3000000 => B3000000,
            3500000 => B3500000,
            4000000 => B4000000,
            _ => return None,
        })
    }

    fn as_nix(self) -> NixBaudRate {
        use BaudRate::*;
        match self {
            B0 => NixBaudRate::B0,
            B50 => NixBaudRate::B50,
            B75 => NixBaudRate::B75,
            B110 => NixBaudRate::B110,
            B134 => NixBaudRate::B134,
            B150 => NixBaudRate::B150,
            B200 => NixBaudRate::B200,
            B300 => NixBaudRate::B300,
            B600 => NixBaudRate::B600,
            B1200 => NixBaudRate::B1200,
            B1800 => NixBaudRate::B1800,
            B2400 => NixBaudRate::B2400,
            B4800 => NixBaudRate::B4800,
            B9600 => NixBaudRate::B9600,
            B19200 => NixBaudRate::B19200,
            B38400 => NixBaudRate::B38400,
            B57600 => NixBaudRate::B57600,
            B115200 => NixBaudRate::B115200,
            B230400 => NixBaudRate::B230400,
            B460800 => NixBaudRate::B460800,
            B500000 => NixBaudRate::B500000,
            B576000 => NixBaudRate::B576000,
            B921600 => NixBaudRate::B921600,
            B1000000 => NixBaudRate::B1000000,
            B1152000 => NixBaudRate::B1152000,
            B1500000 => NixBaudRate::B1500000,
            B2000000 => NixBaudRate::B2000000,
            B2500000 => NixBaudRate::B2500000,
            B3000000 => NixBaudRate::B3000000,
            B3500000 => NixBaudRate::B3500000,
            B4000000 => NixBaudRate::B4000000,
        }
    }
}

/// The termios attributes captured before switching to raw mode, kept
/// around so the caller can restore them on shutdown.
pub struct SavedTermios(Termios);

/// Opens `path`, validates it's a character device and a tty, switches it
/// to raw mode at `baud`, and returns the open handle plus the attributes
/// to restore on exit.
pub fn open_and_configure(
    path: &Path,
    baud: BaudRate,
    hardware_flowctrl: bool,
) -> Result<(File, SavedTermios)> {
    let st = stat(path).map_err(Error::Errno)?;
    if (st.st_mode & libc::S_IFMT) != libc::S_IFCHR {
        return Err(Error::Misconfig(format!(
            "{} is not a character special device",
            path.display()
        )));
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NDELAY)
        .open(path)?;

    let fd = file.as_raw_fd();
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

    if unsafe { libc::isatty(fd) } != 1 {
        return Err(Error::Misconfig(format!("{} is not a tty", path.display())));
    }

    let saved = termios::tcgetattr(borrowed).map_err(Error::Errno)?;
    let mut raw = saved.clone();

    termios::cfsetispeed(&mut raw, baud.as_nix()).map_err(Error::Errno)?;
    termios::cfsetospeed(&mut raw, baud.as_nix()).map_err(Error::Errno)?;

    use nix::sys::termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags};

    raw.local_flags.remove(
        LocalFlags::ICANON | LocalFlags::ISIG | LocalFlags::IEXTEN | LocalFlags::ECHO,
    );
    raw.input_flags.remove(
        InputFlags::BRKINT
            | InputFlags::ICRNL
            | InputFlags::IGNBRK
            | InputFlags::IGNCR
            | InputFlags::INLCR
            | InputFlags::INPCK
            | InputFlags::ISTRIP
            | InputFlags::IXON
            | InputFlags::PARMRK,
    );
    raw.output_flags.remove(OutputFlags::OPOST);

    if hardware_flowctrl {
        raw.control_flags.insert(ControlFlags::CRTSCTS);
    }
    raw.control_flags
        .remove(ControlFlags::CSTOPB | ControlFlags::PARENB | ControlFlags::CSIZE);
    raw.control_flags.insert(ControlFlags::CS8);

    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSAFLUSH, &raw).map_err(Error::Errno)?;

    Ok((file, SavedTermios(saved)))
}

/// Restores the attributes captured by `open_and_configure`. The file is
/// not closed here; the caller drops it separately once the loop returns.
pub fn restore(fd: RawFd, saved: &SavedTermios) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    termios::tcsetattr(borrowed, SetArg::TCSAFLUSH, &saved.0).map_err(Error::Errno)
}
