//! Pty pre-allocation and the console attach socket.
//!
//! The container's ttys (`conf.tty_count` of them) are opened by the parent
//! before `clone`, the way the original `lxc_start.c` opens every tty slave
//! ahead of the child so the child only ever has to `dup2` a descriptor it
//! already owns rather than open a device node inside its own mount
//! namespace. The master halves stay with the parent (the "monitor") for
//! the container's entire lifetime, whether it is running attached in the
//! foreground or has daemonized.
//!
//! A running container's monitor listens on a `AF_UNIX` socket in its run
//! directory (`console.sock`) so a *separate* `lxc-console` invocation,
//! started after the fact, can still reach a tty master: it connects,
//! sends the requested tty index, and receives the master fd back over
//! `SCM_RIGHTS`. This is a strictly local, single-container protocol (one
//! socket per container, one request/response exchange) -- not a remote
//! control plane.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use nix::pty::{openpty, Winsize};
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use nix::sys::uio::IoSlice;
use nix::unistd::{close, dup};

use crate::error::{Error, Result};
use crate::ioutil::retry_eintr;

pub const CONSOLE_SOCK: &str = "console.sock";

/// One allocated tty: the parent keeps the master, the child gets the
/// slave (by fd, already open, ready to `dup2` onto its own stdio).
pub struct Tty {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Opens `count` pseudoterminal pairs with a default window size. Called by
/// the parent before `clone`, so every slave fd is already valid in the
/// child's inherited descriptor table.
pub fn allocate(count: u32) -> Result<Vec<Tty>> {
    let winsize = Winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    (0..count)
        .map(|_| {
            let pty = openpty(Some(&winsize), None).map_err(|e| Error::Tty(e.to_string()))?;
            Ok(Tty {
                master: pty.master,
                slave: pty.slave,
            })
        })
        .collect()
}

/// Serves console-attach requests on `sock_path` until `should_stop`
/// reports the container has exited. Single-threaded: each iteration
/// accepts with a short timeout, answers at most one request, then checks
/// whether the caller's stop condition has fired.
pub fn serve(
    sock_path: &Path,
    masters: &[OwnedFd],
    mut should_stop: impl FnMut() -> bool,
) -> Result<()> {
    let _ = std::fs::remove_file(sock_path);
    let listener = UnixListener::bind(sock_path)?;
    listener.set_nonblocking(true)?;

    loop {
        if should_stop() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = serve_one(stream, masters) {
                    tracing::warn!(error = %e, "console attach request failed");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(e) => return Err(e.into()),
        }
    }
    let _ = std::fs::remove_file(sock_path);
    Ok(())
}

fn serve_one(stream: UnixStream, masters: &[OwnedFd]) -> Result<()> {
    let mut buf = [0u8; 4];
    retry_eintr(|| nix::unistd::read(stream.as_raw_fd(), &mut buf))?;
    let index = u32::from_ne_bytes(buf) as usize;
    let master = masters
        .get(index)
        .ok_or_else(|| Error::Config(format!("no such tty index {index}")))?;
    let dupped = dup(master.as_raw_fd())?;
    let iov = [IoSlice::new(b"k")];
    let fds = [dupped];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    close(dupped)?;
    Ok(())
}

/// Client side: connects to a running container's console socket and asks
/// for the master end of `tty_index`.
pub fn request_master(sock_path: &Path, tty_index: u32) -> Result<OwnedFd> {
    let stream = UnixStream::connect(sock_path)?;
    let fd = stream.as_raw_fd();
    retry_eintr(|| nix::unistd::write(&stream, &tty_index.to_ne_bytes()))?;

    let mut data_buf = [0u8; 1];
    let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 1]);
    let mut iov = [std::io::IoSliceMut::new(&mut data_buf)];
    let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())?;

    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Err(Error::Config("console socket did not return a tty fd".into()))
}
