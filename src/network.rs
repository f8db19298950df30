//! Network operations: typed, one-round-trip wrappers over `netlink.rs`, plus
//! the handful of legacy ioctl and procfs knobs the kernel never moved to
//! netlink (bridge membership, proxy_arp/proxy_ndp, forwarding).
//!
//! Replaces the previous external `slirp4netns`-spawning network manager
//! entirely: every operation here talks directly to the kernel instead of
//! shelling out to a helper binary.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::AsRawFd;

use nix::libc;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::unistd::Pid;

use crate::error::NetError;
use crate::netlink::{NetlinkSocket, NlFamily, NlRequest};

// rtnetlink message types we issue.
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_SETLINK: u16 = 19;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_EXCL: u16 = 0x200;

// IFLA_* attribute ids.
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_LINK: u16 = 5;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;
const IFLA_MACVLAN_MODE: u16 = 1;
const MACVLAN_MODE_BRIDGE: u32 = 4;

// IFA_* attribute ids.
const IFA_LOCAL: u16 = 2;
const IFA_ADDRESS: u16 = 1;
const IFA_BROADCAST: u16 = 4;

// RTA_* attribute ids.
const RTA_GATEWAY: u16 = 5;
const RTA_OIF: u16 = 4;

const IFF_UP: u32 = 0x1;

/// `struct ifinfomsg`.
#[derive(Default, Clone, Copy)]
struct IfInfoMsg {
    ifi_family: u8,
    pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

impl IfInfoMsg {
    fn bytes(self) -> Vec<u8> {
        let mut v = Vec::with_capacity(16);
        v.push(self.ifi_family);
        v.push(self.pad);
        v.extend_from_slice(&self.ifi_type.to_ne_bytes());
        v.extend_from_slice(&self.ifi_index.to_ne_bytes());
        v.extend_from_slice(&self.ifi_flags.to_ne_bytes());
        v.extend_from_slice(&self.ifi_change.to_ne_bytes());
        v
    }
}

/// `struct ifaddrmsg`.
#[derive(Default, Clone, Copy)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

impl IfAddrMsg {
    fn bytes(self) -> Vec<u8> {
        let mut v = vec![self.ifa_family, self.ifa_prefixlen, self.ifa_flags, self.ifa_scope];
        v.extend_from_slice(&self.ifa_index.to_ne_bytes());
        v
    }
}

/// `struct rtmsg`.
#[derive(Default, Clone, Copy)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

impl RtMsg {
    fn bytes(self) -> Vec<u8> {
        let mut v = vec![
            self.rtm_family,
            self.rtm_dst_len,
            self.rtm_src_len,
            self.rtm_tos,
            self.rtm_table,
            self.rtm_protocol,
            self.rtm_scope,
            self.rtm_type,
        ];
        v.extend_from_slice(&self.rtm_flags.to_ne_bytes());
        v
    }
}

const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

/// Parses a colon-separated hex MAC address string into its 6 octets.
/// Fails with [`NetError::Inval`] on malformed input.
pub fn convert_mac(s: &str) -> std::result::Result<[u8; 6], NetError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(NetError::Inval);
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).map_err(|_| NetError::Inval)?;
    }
    Ok(mac)
}

/// Renders a MAC address back to its lowercase colon-separated form.
pub fn format_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn ifindex_of(name: &str) -> std::result::Result<i32, NetError> {
    nix::net::if_::if_nametoindex(name)
        .map(|i| i as i32)
        .map_err(|_| NetError::NotFound)
}

fn open_route_socket() -> std::result::Result<NetlinkSocket, NetError> {
    NetlinkSocket::open(NlFamily::Route).map_err(|_| NetError::Io(libc::EIO))
}

/// Moves `name` into the network namespace of `pid`.
pub fn device_move(name: &str, pid: Pid) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(name)?;
    let info = IfInfoMsg {
        ifi_index: ifindex,
        ..Default::default()
    };
    let mut req = NlRequest::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, info.bytes());
    req.attrs_mut()
        .push_u32(IFLA_NET_NS_PID, pid.as_raw() as u32)
        .map_err(|_| NetError::Inval)?;
    sock.roundtrip(req)
}

fn setlink_flags(name: &str, up: bool) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(name)?;
    let info = IfInfoMsg {
        ifi_index: ifindex,
        ifi_flags: if up { IFF_UP } else { 0 },
        ifi_change: IFF_UP,
        ..Default::default()
    };
    let req = NlRequest::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, info.bytes());
    sock.roundtrip(req)
}

pub fn device_up(name: &str) -> std::result::Result<(), NetError> {
    setlink_flags(name, true)
}

pub fn device_down(name: &str) -> std::result::Result<(), NetError> {
    setlink_flags(name, false)
}

pub fn device_delete(name: &str) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(name)?;
    let info = IfInfoMsg {
        ifi_index: ifindex,
        ..Default::default()
    };
    let req = NlRequest::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, info.bytes());
    sock.roundtrip(req)
}

/// Renames `old` to `new`. Fails with [`NetError::Exists`] if `new` is
/// already in use by another interface.
pub fn device_rename(old: &str, new: &str) -> std::result::Result<(), NetError> {
    if nix::net::if_::if_nametoindex(new).is_ok() {
        return Err(NetError::Exists);
    }
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(old)?;
    let info = IfInfoMsg {
        ifi_index: ifindex,
        ..Default::default()
    };
    let mut req = NlRequest::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, info.bytes());
    req.attrs_mut()
        .push_str(IFLA_IFNAME, new)
        .map_err(|_| NetError::Inval)?;
    sock.roundtrip(req)
}

pub fn device_set_mtu(name: &str, mtu: u32) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(name)?;
    let info = IfInfoMsg {
        ifi_index: ifindex,
        ..Default::default()
    };
    let mut req = NlRequest::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, info.bytes());
    req.attrs_mut()
        .push_u32(IFLA_MTU, mtu)
        .map_err(|_| NetError::Inval)?;
    sock.roundtrip(req)
}

/// Sets `name`'s link-layer address to `mac`.
pub fn device_set_mac(name: &str, mac: [u8; 6]) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(name)?;
    let info = IfInfoMsg {
        ifi_index: ifindex,
        ..Default::default()
    };
    let mut req = NlRequest::new(RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK, info.bytes());
    req.attrs_mut()
        .push(IFLA_ADDRESS, &mac)
        .map_err(|_| NetError::Inval)?;
    sock.roundtrip(req)
}

/// Creates a veth pair `name1`/`name2`. The kernel creates both endpoints or
/// neither; on error, do not attempt to clean up either name.
pub fn veth_create(name1: &str, name2: &str) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let info = IfInfoMsg::default();
    let mut req = NlRequest::new(
        RTM_NEWLINK,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        info.bytes(),
    );
    req.attrs_mut()
        .push_str(IFLA_IFNAME, name1)
        .map_err(|_| NetError::Inval)?;
    {
        let mut linkinfo = req.attrs_mut().nest(IFLA_LINKINFO);
        linkinfo
            .attrs()
            .push_str(IFLA_INFO_KIND, "veth")
            .map_err(|_| NetError::Inval)?;
        {
            let mut data = linkinfo.attrs().nest(IFLA_INFO_DATA);
            let mut peer = data.attrs().nest(VETH_INFO_PEER);
            peer.attrs()
                .push_str(IFLA_IFNAME, name2)
                .map_err(|_| NetError::Inval)?;
        }
    }
    sock.roundtrip(req)
}

/// Creates a macvlan device named `name` on top of `master`, in bridge mode.
pub fn macvlan_create(master: &str, name: &str) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let master_index = ifindex_of(master)?;
    let info = IfInfoMsg::default();
    let mut req = NlRequest::new(
        RTM_NEWLINK,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        info.bytes(),
    );
    req.attrs_mut()
        .push_str(IFLA_IFNAME, name)
        .map_err(|_| NetError::Inval)?;
    req.attrs_mut()
        .push_u32(IFLA_LINK, master_index as u32)
        .map_err(|_| NetError::Inval)?;
    {
        let mut linkinfo = req.attrs_mut().nest(IFLA_LINKINFO);
        linkinfo
            .attrs()
            .push_str(IFLA_INFO_KIND, "macvlan")
            .map_err(|_| NetError::Inval)?;
        {
            let mut data = linkinfo.attrs().nest(IFLA_INFO_DATA);
            data.attrs()
                .push_u32(IFLA_MACVLAN_MODE, MACVLAN_MODE_BRIDGE)
                .map_err(|_| NetError::Inval)?;
        }
    }
    sock.roundtrip(req)
}

/// Adds an IPv4 address. Adding an address that already exists returns
/// [`NetError::Exists`] rather than being silently accepted.
pub fn ip_addr_add(
    ifname: &str,
    addr: Ipv4Addr,
    prefix: u8,
    bcast: Option<Ipv4Addr>,
) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(ifname)?;
    let msg = IfAddrMsg {
        ifa_family: libc::AF_INET as u8,
        ifa_prefixlen: prefix,
        ifa_index: ifindex as u32,
        ..Default::default()
    };
    let mut req = NlRequest::new(
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        msg.bytes(),
    );
    req.attrs_mut()
        .push(IFA_LOCAL, &addr.octets())
        .map_err(|_| NetError::Inval)?;
    req.attrs_mut()
        .push(IFA_ADDRESS, &addr.octets())
        .map_err(|_| NetError::Inval)?;
    if let Some(bcast) = bcast {
        req.attrs_mut()
            .push(IFA_BROADCAST, &bcast.octets())
            .map_err(|_| NetError::Inval)?;
    }
    sock.roundtrip(req)
}

/// Adds an IPv6 address, same semantics as [`ip_addr_add`].
pub fn ip6_addr_add(ifname: &str, addr: Ipv6Addr, prefix: u8) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(ifname)?;
    let msg = IfAddrMsg {
        ifa_family: libc::AF_INET6 as u8,
        ifa_prefixlen: prefix,
        ifa_index: ifindex as u32,
        ..Default::default()
    };
    let mut req = NlRequest::new(
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        msg.bytes(),
    );
    req.attrs_mut()
        .push(IFA_LOCAL, &addr.octets())
        .map_err(|_| NetError::Inval)?;
    req.attrs_mut()
        .push(IFA_ADDRESS, &addr.octets())
        .map_err(|_| NetError::Inval)?;
    sock.roundtrip(req)
}

fn ifreq_bytes(name: &str, ifindex: i32) -> [u8; 32] {
    let mut buf = [0u8; 32];
    let name_bytes = name.as_bytes();
    let len = name_bytes.len().min(15);
    buf[..len].copy_from_slice(&name_bytes[..len]);
    buf[16..20].copy_from_slice(&ifindex.to_ne_bytes());
    buf
}

const SIOCBRADDIF: u64 = 0x89a2;
const SIOCBRDELIF: u64 = 0x89a3;

fn bridge_ioctl(bridge: &str, ifname: &str, request: u64) -> std::result::Result<(), NetError> {
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(|_| NetError::Io(libc::EIO))?;
    // SIOCBRADDIF/DELIF are only valid if `bridge` actually names a bridge
    // device; the kernel rejects otherwise with ENOTSUP/EINVAL, surfaced
    // below through from_errno.
    if nix::net::if_::if_nametoindex(bridge).is_err() {
        return Err(NetError::NotFound);
    }
    let ifindex = ifindex_of(ifname)?;
    let ifreq = ifreq_bytes(bridge, ifindex);
    let ret = unsafe {
        libc::ioctl(
            sock.as_raw_fd(),
            request,
            ifreq.as_ptr() as *const libc::c_void,
        )
    };
    if ret < 0 {
        let errno = nix::errno::Errno::last();
        return Err(NetError::from_errno(errno));
    }
    Ok(())
}

/// Attaches `ifname` to `bridge` using the legacy `SIOCBRADDIF` ioctl.
/// Fails if `bridge` does not name a bridge device.
pub fn bridge_attach(bridge: &str, ifname: &str) -> std::result::Result<(), NetError> {
    bridge_ioctl(bridge, ifname, SIOCBRADDIF)
}

pub fn bridge_detach(bridge: &str, ifname: &str) -> std::result::Result<(), NetError> {
    bridge_ioctl(bridge, ifname, SIOCBRDELIF)
}

#[derive(Debug, Clone, Copy)]
pub enum Family {
    Inet,
    Inet6,
}

fn route_default(
    gw_bytes: &[u8],
    ifname: &str,
    family: Family,
    msg_type: u16,
    flags: u16,
) -> std::result::Result<(), NetError> {
    let sock = open_route_socket()?;
    let ifindex = ifindex_of(ifname)?;
    let rtm_family = match family {
        Family::Inet => libc::AF_INET as u8,
        Family::Inet6 => libc::AF_INET6 as u8,
    };
    let msg = RtMsg {
        rtm_family,
        rtm_table: RT_TABLE_MAIN,
        rtm_protocol: RTPROT_BOOT,
        rtm_scope: RT_SCOPE_UNIVERSE,
        rtm_type: RTN_UNICAST,
        ..Default::default()
    };
    let mut req = NlRequest::new(msg_type, flags, msg.bytes());
    req.attrs_mut()
        .push(RTA_GATEWAY, gw_bytes)
        .map_err(|_| NetError::Inval)?;
    req.attrs_mut()
        .push_u32(RTA_OIF, ifindex as u32)
        .map_err(|_| NetError::Inval)?;
    sock.roundtrip(req)
}

/// Installs a default route via `gw` out of `ifname`.
pub fn route_create_default(
    gw: std::net::IpAddr,
    ifname: &str,
    family: Family,
) -> std::result::Result<(), NetError> {
    let bytes: Vec<u8> = match gw {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    route_default(
        &bytes,
        ifname,
        family,
        RTM_NEWROUTE,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
    )
}

pub fn route_delete_default(
    gw: std::net::IpAddr,
    ifname: &str,
    family: Family,
) -> std::result::Result<(), NetError> {
    let bytes: Vec<u8> = match gw {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    route_default(&bytes, ifname, family, RTM_DELROUTE, NLM_F_REQUEST | NLM_F_ACK)
}

fn proxy_knob_path(ifname: &str, family: Family) -> String {
    match family {
        Family::Inet => format!("/proc/sys/net/ipv4/conf/{ifname}/proxy_arp"),
        Family::Inet6 => format!("/proc/sys/net/ipv6/conf/{ifname}/proxy_ndp"),
    }
}

fn forward_knob_path(ifname: &str, family: Family) -> String {
    match family {
        Family::Inet => format!("/proc/sys/net/ipv4/conf/{ifname}/forwarding"),
        Family::Inet6 => format!("/proc/sys/net/ipv6/conf/{ifname}/forwarding"),
    }
}

fn write_knob(path: &str, value: &str) -> std::result::Result<(), NetError> {
    std::fs::write(path, value).map_err(|e| NetError::Io(e.raw_os_error().unwrap_or(libc::EIO)))
}

pub fn neigh_proxy_on(ifname: &str, family: Family) -> std::result::Result<(), NetError> {
    write_knob(&proxy_knob_path(ifname, family), "1")
}

pub fn neigh_proxy_off(ifname: &str, family: Family) -> std::result::Result<(), NetError> {
    write_knob(&proxy_knob_path(ifname, family), "0")
}

pub fn ip_forward_on(ifname: &str, family: Family) -> std::result::Result<(), NetError> {
    write_knob(&forward_knob_path(ifname, family), "1")
}

pub fn ip_forward_off(ifname: &str, family: Family) -> std::result::Result<(), NetError> {
    write_knob(&forward_knob_path(ifname, family), "0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_round_trip() {
        let mac = convert_mac("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(format_mac(mac), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn mac_rejects_malformed() {
        assert!(convert_mac("not-a-mac").is_err());
        assert!(convert_mac("aa:bb:cc").is_err());
    }
}
