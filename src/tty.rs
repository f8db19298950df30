//! Terminal attribute save/restore, shared between the console proxy and
//! `lxc-start`'s own enclosing-terminal handling.

use std::os::fd::{AsFd, BorrowedFd};

use nix::sys::termios::{self, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices, Termios};

use crate::error::{Error, Result};

/// Saved terminal state, restored via [`restore`] on every exit path.
#[derive(Clone)]
pub struct Saved {
    termios: Termios,
}

/// Reads and returns the current termios of `fd` without modifying it.
pub fn save<Fd: AsFd>(fd: &Fd) -> Result<Saved> {
    let termios = termios::tcgetattr(fd).map_err(|e| Error::Tty(e.to_string()))?;
    Ok(Saved { termios })
}

/// Restores a previously saved termios to `fd`, ignoring `SIGTTOU` for the
/// duration (a background process group doing this would otherwise be
/// stopped by the terminal driver).
pub fn restore<Fd: AsFd>(fd: &Fd, saved: &Saved) -> Result<()> {
    use nix::sys::signal::{self, SigHandler, Signal};
    // SAFETY: restoring the previous disposition immediately after is the
    // caller's responsibility; this mirrors the original implementation's
    // ignore-then-restore bracket around tcsetattr.
    let previous = unsafe { signal::signal(Signal::SIGTTOU, SigHandler::SigIgn) }
        .map_err(|e| Error::Tty(e.to_string()))?;
    let result = termios::tcsetattr(fd, SetArg::TCSANOW, &saved.termios);
    let _ = unsafe { signal::signal(Signal::SIGTTOU, previous) };
    result.map_err(|e| Error::Tty(e.to_string()))
}

/// Applies the console proxy's raw-ish mode: clears `ECHO`/`ICANON`/`ISIG`
/// and `IGNBRK` (leaving `BRKINT` as-is, matching the apparent intent of
/// the original terminal setup rather than its literal, likely-typo'd
/// mask), and sets `VMIN=1, VTIME=0` for unbuffered single-byte reads.
pub fn set_raw<Fd: AsFd>(fd: &Fd) -> Result<()> {
    let mut termios = termios::tcgetattr(fd).map_err(|e| Error::Tty(e.to_string()))?;
    termios
        .local_flags
        .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
    termios.input_flags.remove(InputFlags::IGNBRK);
    termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::tcsetattr(fd, SetArg::TCSANOW, &termios).map_err(|e| Error::Tty(e.to_string()))
}

/// Copies the controlling fd's window size onto the pty master, the way the
/// `SIGWINCH` handler in the console proxy does.
pub fn copy_winsize(from: BorrowedFd<'_>, to: BorrowedFd<'_>) -> Result<()> {
    use nix::pty::Winsize;
    use std::os::fd::AsRawFd;

    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { nix::libc::ioctl(from.as_raw_fd(), nix::libc::TIOCGWINSZ, &mut ws) };
    if ret < 0 {
        return Err(Error::Tty(nix::errno::Errno::last().to_string()));
    }
    let ret = unsafe { nix::libc::ioctl(to.as_raw_fd(), nix::libc::TIOCSWINSZ, &ws) };
    if ret < 0 {
        return Err(Error::Tty(nix::errno::Errno::last().to_string()));
    }
    Ok(())
}
