//! Console proxy: attaches the controlling terminal to a container's pty
//! master, forwarding bytes both ways, tracking window size, and
//! recognising a user-chosen escape sequence that exits the proxy without
//! touching the container.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{read, write};

use crate::error::{Error, Result};
use crate::ioutil::retry_eintr;
use crate::tty;

/// Derives the escape control byte from a user expression: `^X` takes the
/// letter after the caret, otherwise the first character is used; the
/// standard control-letter mapping (`c - 'A' + 1` / `c - 'a' + 1`) is then
/// applied. Defaults to `Ctrl-A` (0x01) for an empty expression.
pub fn escape_byte(expr: &str) -> u8 {
    let c = if let Some(rest) = expr.strip_prefix('^') {
        rest.chars().next()
    } else {
        expr.chars().next()
    };
    let c = match c {
        Some(c) => c,
        None => return 0x01,
    };
    if c.is_ascii_uppercase() {
        (c as u8) - b'A' + 1
    } else if c.is_ascii_lowercase() {
        (c as u8) - b'a' + 1
    } else {
        c as u8
    }
}

static mut WINCH_PENDING: bool = false;

extern "C" fn on_winch(_: i32) {
    // SAFETY: a single bool flag toggled from a signal handler and polled
    // from the main loop; no allocation, no reentrancy hazard.
    unsafe {
        WINCH_PENDING = true;
    }
}

fn take_winch_pending() -> bool {
    unsafe {
        let pending = WINCH_PENDING;
        WINCH_PENDING = false;
        pending
    }
}

/// Runs the proxy loop until the escape sequence or a master-side hangup
/// ends it. `stdin`/`stdout` are the controlling terminal's descriptors;
/// `master` is the pty master. Returns once either side is done.
pub fn attach(stdin: BorrowedFd<'_>, stdout: &mut impl Write, master: OwnedFd, escape: u8) -> Result<()> {
    eprintln!(
        "Type <Ctrl-{} q> to exit the console.",
        (escape + b'a' - 1) as char
    );

    let saved = tty::save(&stdin)?;
    tty::set_raw(&stdin)?;
    let restore_guard = RestoreGuard { fd: stdin, saved };

    let handler = SigAction::new(SigHandler::Handler(on_winch), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: installing a process-wide handler for the duration of the
    // proxy loop; restored implicitly on process exit, matching the
    // original console's lifetime (one proxy per process invocation).
    unsafe { signal::sigaction(Signal::SIGWINCH, &handler) }
        .map_err(|e| Error::Tty(e.to_string()))?;
    let _ = tty::copy_winsize(stdin, master.as_fd());

    let mut armed = false;
    let mut byte = [0u8; 1];
    let mut chunk = [0u8; 1024];

    loop {
        if take_winch_pending() {
            let _ = tty::copy_winsize(stdin, master.as_fd());
        }

        let mut fds = [
            PollFd::new(stdin, PollFlags::POLLIN),
            PollFd::new(master.as_fd(), PollFlags::POLLIN),
        ];
        let ready = match retry_eintr(|| nix::poll::poll(&mut fds, PollTimeout::NONE)) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };
        if ready == 0 {
            continue;
        }

        let stdin_events = fds[0].revents().unwrap_or(PollFlags::empty());
        let master_events = fds[1].revents().unwrap_or(PollFlags::empty());

        if master_events.contains(PollFlags::POLLHUP) {
            break;
        }

        if stdin_events.contains(PollFlags::POLLIN) {
            let n = retry_eintr(|| read(stdin.as_raw_fd(), &mut byte))?;
            if n == 0 {
                break;
            }
            let b = byte[0];
            if b == escape {
                armed = !armed;
                continue;
            }
            if armed && b == b'q' {
                break;
            }
            armed = false;
            retry_eintr(|| write(&master, &byte))?;
        }

        if master_events.contains(PollFlags::POLLIN) {
            let n = retry_eintr(|| read(master.as_raw_fd(), &mut chunk))?;
            if n == 0 {
                break;
            }
            stdout.write_all(&chunk[..n]).map_err(Error::Io)?;
            stdout.flush().map_err(Error::Io)?;
        }
    }

    drop(restore_guard);
    Ok(())
}

struct RestoreGuard<'a> {
    fd: BorrowedFd<'a>,
    saved: tty::Saved,
}

impl<'a> Drop for RestoreGuard<'a> {
    fn drop(&mut self) {
        let _ = tty::restore(&self.fd, &self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_default_is_ctrl_a() {
        assert_eq!(escape_byte(""), 0x01);
    }

    #[test]
    fn escape_caret_form() {
        assert_eq!(escape_byte("^a"), 0x01);
        assert_eq!(escape_byte("^A"), 0x01);
        assert_eq!(escape_byte("^x"), 0x18);
    }

    #[test]
    fn escape_bare_letter_form() {
        assert_eq!(escape_byte("a"), 0x01);
        assert_eq!(escape_byte("q"), 0x11);
    }
}
