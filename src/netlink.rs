//! Netlink transport: request/response framing over a routing socket,
//! sequence tracking, multipart reassembly, and a small attribute TLV
//! builder that owns its backing buffer instead of relying on raw pointer
//! arithmetic over a shared scratch buffer.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{
    bind, recvfrom, sendto, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};

use crate::error::{NetError, Result};
use crate::ioutil::retry_eintr;

/// Minimum buffer size for a netlink datagram, matching the kernel's own
/// advertised minimum (`NLMSG_GOODSIZE`-adjacent convention).
const NLMSG_BUF: usize = 16 * 1024;
const NLMSG_ALIGNTO: usize = 4;

fn align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Netlink socket family. Only the routing family is needed by this crate's
/// network operations.
#[derive(Debug, Clone, Copy)]
pub enum NlFamily {
    Route,
}

impl NlFamily {
    fn protocol(self) -> SockProtocol {
        match self {
            NlFamily::Route => SockProtocol::NetlinkRoute,
        }
    }
}

/// An open netlink socket, bound to a kernel-assigned unicast port, with a
/// monotonically increasing per-socket sequence counter.
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: AtomicU32,
    pid: u32,
}

impl NetlinkSocket {
    pub fn open(family: NlFamily) -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            Some(family.protocol()),
        )?;
        // Let the kernel assign our unicast port id.
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
        let addr: NetlinkAddr = nix::sys::socket::getsockname(fd.as_raw_fd())?;
        Ok(Self {
            fd,
            // Seed from the process id the way a freshly opened routing
            // socket conventionally does; the kernel-assigned port below is
            // what actually disambiguates concurrent sockets.
            seq: AtomicU32::new(std::process::id()),
            pid: addr.pid(),
        })
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Serializes and sends `req`, stamping a fresh sequence number. Returns
    /// the sequence number so the caller can match the response.
    pub fn send(&self, mut req: NlRequest) -> Result<u32> {
        let seq = self.next_seq();
        req.header.nlmsg_seq = seq;
        req.header.nlmsg_pid = self.pid;
        let buf = req.serialize()?;
        let sent = retry_eintr(|| {
            sendto(
                self.fd.as_raw_fd(),
                &buf,
                &NetlinkAddr::new(0, 0),
                MsgFlags::empty(),
            )
        })?;
        if sent != buf.len() {
            return Err(crate::error::Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "short netlink write",
            )));
        }
        Ok(seq)
    }

    /// Waits for the ACK (or error) matching `expect_seq`, reassembling
    /// multipart responses until `NLMSG_DONE`. Ignores anything else,
    /// including multicast traffic.
    pub fn recv(&self, expect_seq: u32) -> std::result::Result<(), NetError> {
        let mut buf = [0u8; NLMSG_BUF];
        loop {
            let (n, _addr) = retry_eintr(|| recvfrom::<NetlinkAddr>(self.fd.as_raw_fd(), &mut buf))
                .map_err(|_| NetError::Io(libc::EIO))?;
            if n < std::mem::size_of::<NlHeader>() {
                continue;
            }
            let mut offset = 0;
            while offset + std::mem::size_of::<NlHeader>() <= n {
                let header = NlHeader::read(&buf[offset..]);
                let msg_len = header.nlmsg_len as usize;
                if msg_len < std::mem::size_of::<NlHeader>() || offset + msg_len > n {
                    break;
                }
                if header.nlmsg_seq == expect_seq {
                    match header.nlmsg_type {
                        libc::NLMSG_ERROR as u16 => {
                            let errno_off = offset + std::mem::size_of::<NlHeader>();
                            let code = i32::from_ne_bytes(
                                buf[errno_off..errno_off + 4].try_into().unwrap(),
                            );
                            if code == 0 {
                                return Ok(());
                            }
                            return Err(NetError::from_errno(Errno::from_raw(-code)));
                        }
                        t if t == libc::NLMSG_DONE as u16 => return Ok(()),
                        _ => {
                            // Part of a multipart response we don't need the
                            // payload of; keep reading until DONE/ERROR.
                        }
                    }
                }
                offset += align(msg_len);
            }
        }
    }

    /// Convenience: send then recv, for the common single round-trip ops.
    pub fn roundtrip(&self, req: NlRequest) -> std::result::Result<(), NetError> {
        let seq = self.send(req).map_err(|_| NetError::Io(libc::EIO))?;
        self.recv(seq)
    }
}

/// Fixed-size netlink message header (`struct nlmsghdr`).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct NlHeader {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

impl NlHeader {
    fn read(buf: &[u8]) -> Self {
        Self {
            nlmsg_len: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            nlmsg_type: u16::from_ne_bytes(buf[4..6].try_into().unwrap()),
            nlmsg_flags: u16::from_ne_bytes(buf[6..8].try_into().unwrap()),
            nlmsg_seq: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
            nlmsg_pid: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

/// A netlink request: header flags/type, a fixed family payload (e.g.
/// `ifinfomsg`/`ifaddrmsg`/`rtmsg`), and a TLV attribute list built with
/// [`AttrBuf`].
pub struct NlRequest {
    header: NlHeader,
    payload: Vec<u8>,
    attrs: AttrBuf,
}

impl NlRequest {
    pub fn new(nlmsg_type: u16, flags: u16, payload: Vec<u8>) -> Self {
        Self {
            header: NlHeader {
                nlmsg_len: 0,
                nlmsg_type,
                nlmsg_flags: flags,
                nlmsg_seq: 0,
                nlmsg_pid: 0,
            },
            payload,
            attrs: AttrBuf::new(NLMSG_BUF),
        }
    }

    pub fn attrs_mut(&mut self) -> &mut AttrBuf {
        &mut self.attrs
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let header_len = std::mem::size_of::<NlHeader>();
        let payload_len = align(self.payload.len());
        let total = header_len + payload_len + self.attrs.len();
        if total > NLMSG_BUF {
            return Err(crate::error::Error::Config(format!(
                "netlink request of {total} bytes exceeds the {NLMSG_BUF} byte buffer"
            )));
        }
        let mut buf = Vec::with_capacity(total);
        let mut header = self.header;
        header.nlmsg_len = total as u32;
        buf.extend_from_slice(&header.nlmsg_len.to_ne_bytes());
        buf.extend_from_slice(&header.nlmsg_type.to_ne_bytes());
        buf.extend_from_slice(&header.nlmsg_flags.to_ne_bytes());
        buf.extend_from_slice(&header.nlmsg_seq.to_ne_bytes());
        buf.extend_from_slice(&header.nlmsg_pid.to_ne_bytes());
        buf.extend_from_slice(&self.payload);
        buf.resize(header_len + payload_len, 0);
        buf.extend_from_slice(self.attrs.as_slice());
        Ok(buf)
    }
}

/// Small buffer-owning TLV (type, length, value) writer. Pads each value to
/// a 4-byte boundary and refuses to emit past its capacity.
pub struct AttrBuf {
    buf: Vec<u8>,
    cap: usize,
}

impl AttrBuf {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Appends one TLV attribute. `attr_type` is the kernel `IFLA_*`/
    /// `IFA_*`/`RTA_*`/`VETH_INFO_*` constant; `value` is the raw attribute
    /// payload (caller is responsible for host-byte-order encoding).
    pub fn push(&mut self, attr_type: u16, value: &[u8]) -> Result<()> {
        let attr_len = 4 + value.len();
        let padded = align(attr_len);
        if self.buf.len() + padded > self.cap {
            return Err(crate::error::Error::Config(format!(
                "attribute buffer overflow: would exceed {} byte capacity",
                self.cap
            )));
        }
        self.buf.extend_from_slice(&(attr_len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self.buf.resize(self.buf.len() + (padded - attr_len), 0);
        Ok(())
    }

    pub fn push_u32(&mut self, attr_type: u16, value: u32) -> Result<()> {
        self.push(attr_type, &value.to_ne_bytes())
    }

    pub fn push_str(&mut self, attr_type: u16, value: &str) -> Result<()> {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.push(attr_type, &bytes)
    }

    /// Opens a nested attribute (e.g. `VETH_INFO_PEER`). The returned guard
    /// writes a placeholder length now and backpatches it with the nested
    /// content's length when dropped, mirroring how `libmnl`-style nest
    /// helpers work but scoped to this buffer.
    pub fn nest(&mut self, attr_type: u16) -> NestGuard<'_> {
        let start = self.buf.len();
        // Reserve the 4-byte TLV header; backpatched on drop.
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        NestGuard { attrs: self, start }
    }
}

pub struct NestGuard<'a> {
    attrs: &'a mut AttrBuf,
    start: usize,
}

impl<'a> NestGuard<'a> {
    pub fn attrs(&mut self) -> &mut AttrBuf {
        self.attrs
    }
}

impl<'a> Drop for NestGuard<'a> {
    fn drop(&mut self) {
        let len = self.attrs.buf.len() - self.start;
        let len_bytes = (len as u16).to_ne_bytes();
        self.attrs.buf[self.start] = len_bytes[0];
        self.attrs.buf[self.start + 1] = len_bytes[1];
        let padded = align(len);
        self.attrs.buf.resize(self.start + padded, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_alignment() {
        let mut attrs = AttrBuf::new(64);
        attrs.push(1, b"ab").unwrap(); // 4 + 2 = 6, padded to 8
        assert_eq!(attrs.len(), 8);
    }

    #[test]
    fn attr_overflow_refused() {
        let mut attrs = AttrBuf::new(8);
        attrs.push(1, b"ab").unwrap();
        assert!(attrs.push(2, b"cdef").is_err());
    }

    #[test]
    fn nested_attr_length_backpatched() {
        let mut attrs = AttrBuf::new(64);
        {
            let mut nest = attrs.nest(10);
            nest.attrs().push_str(11, "veth1").unwrap();
        }
        // nest header (4) + inner attr (4 + 6 padded to 8) = 12, already aligned.
        assert_eq!(attrs.len(), 12);
        let len = u16::from_ne_bytes(attrs.as_slice()[0..2].try_into().unwrap());
        assert_eq!(len as usize, 12);
    }
}
