//! Parent/child step-coordination primitive.
//!
//! Two endpoints of a connected, `CLOEXEC` byte-stream pair carry a strictly
//! increasing sequence-number handshake between the parent and the child
//! during container launch. This mirrors the original `sync.c`'s
//! `socketpair(AF_LOCAL, SOCK_STREAM, ...)` plus `FD_CLOEXEC` on the parent's
//! end, so that `execve` in the child implicitly closes its copy.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{read, write};

use crate::error::{Error, Result, SyncError};
use crate::ioutil::retry_eintr;

/// Reserved sentinel written by either side to signal an abort. Chosen to be
/// unreachable as a real protocol sequence number.
pub const SYNC_ERROR: u32 = u32::MAX;

pub const POST_CONFIGURE: u32 = 1;
pub const POST_NETWORK: u32 = 2;
pub const POST_CGROUP: u32 = 3;
pub const POST_START: u32 = 4;

/// Outcome of a `wait`: either the expected sequence number was observed, or
/// the peer closed its end cleanly (read returned 0 bytes).
///
/// A clean peer close is equivalent to "reached the final step" and is only
/// valid as a success outcome at `POST_START`; callers waiting on an earlier
/// barrier must treat it as a protocol violation (see [`SyncEnd::barrier`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reached,
    PeerClosed,
}

/// One endpoint of the sync channel, held by either the parent or the child
/// after the peer's end has been closed post-fork.
pub struct SyncEnd(OwnedFd);

impl AsRawFd for SyncEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl SyncEnd {
    /// Creates a connected, close-on-exec pair of endpoints. The caller keeps
    /// one end in each process and drops the other immediately after fork.
    pub fn pair() -> Result<(SyncEnd, SyncEnd)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((SyncEnd(a), SyncEnd(b)))
    }

    /// Writes the 4-byte sequence number `n`. Fails if the peer has closed.
    pub fn wake(&mut self, n: u32) -> Result<()> {
        let buf = n.to_ne_bytes();
        let mut written = 0;
        while written < buf.len() {
            let n = retry_eintr(|| write(&self.0, &buf[written..]))?;
            if n == 0 {
                return Err(SyncError::PeerAbort.into());
            }
            written += n;
        }
        Ok(())
    }

    /// Reads a 4-byte sequence number and compares it against `n`.
    ///
    /// Returns `Ok(WaitOutcome::PeerClosed)` if the peer closed cleanly
    /// before writing anything; fails with `SyncError::PeerAbort` if the
    /// value read is the [`SYNC_ERROR`] sentinel, or `SyncError::Desync` if
    /// it does not match `n`.
    pub fn wait(&mut self, n: u32) -> Result<WaitOutcome> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            let fd = self.0.as_raw_fd();
            let read_n =
                retry_eintr(|| read(fd, &mut buf[filled..]))?;
            if read_n == 0 {
                if filled == 0 {
                    return Ok(WaitOutcome::PeerClosed);
                }
                return Err(SyncError::PeerAbort.into());
            }
            filled += read_n;
        }
        let value = u32::from_ne_bytes(buf);
        if value == SYNC_ERROR {
            return Err(SyncError::PeerAbort.into());
        }
        if value != n {
            return Err(SyncError::Desync {
                expected: n,
                got: value,
            }
            .into());
        }
        Ok(WaitOutcome::Reached)
    }

    /// `wake(n)` followed by `wait(n + 1)`. This is the primitive the launch
    /// protocol actually uses at every documented point.
    pub fn barrier(&mut self, n: u32) -> Result<()> {
        self.wake(n)?;
        match self.wait(n + 1)? {
            WaitOutcome::Reached => Ok(()),
            // A clean close is only meaningful at POST_START; any earlier
            // barrier observing it indicates the peer vanished mid-protocol.
            WaitOutcome::PeerClosed => Err(SyncError::PeerAbort.into()),
        }
    }

    /// Signals an abort to the peer. Best-effort: if the peer is already
    /// gone this is a no-op rather than a new error.
    pub fn abort(&mut self) {
        let _ = self.wake(SYNC_ERROR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_round_trip() {
        let (mut p, mut c) = SyncEnd::pair().unwrap();
        let parent = std::thread::spawn(move || {
            p.barrier(POST_CONFIGURE).unwrap();
        });
        c.wait(POST_CONFIGURE).unwrap();
        c.wake(POST_CONFIGURE + 1).unwrap();
        parent.join().unwrap();
    }

    #[test]
    fn desync_is_fatal() {
        let (mut p, mut c) = SyncEnd::pair().unwrap();
        let parent = std::thread::spawn(move || p.wait(POST_CONFIGURE));
        c.wake(POST_NETWORK).unwrap();
        let err = parent.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Sync(SyncError::Desync {
                expected: POST_CONFIGURE,
                got: POST_NETWORK,
            })
        ));
    }

    #[test]
    fn peer_abort_is_observed() {
        let (mut p, mut c) = SyncEnd::pair().unwrap();
        let parent = std::thread::spawn(move || p.wait(POST_CONFIGURE));
        c.abort();
        let err = parent.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Sync(SyncError::PeerAbort)));
    }

    #[test]
    fn clean_close_is_peer_closed() {
        let (mut p, c) = SyncEnd::pair().unwrap();
        drop(c);
        let outcome = p.wait(POST_START).unwrap();
        assert_eq!(outcome, WaitOutcome::PeerClosed);
    }
}
