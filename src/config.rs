//! `lxc.*` key/value configuration grammar: one `key = value` (or
//! `key.subkey = value`) per line, `#`-comments and blank lines skipped.
//! Builds up a [`Conf`] the way the original `confile.c` dispatches each
//! parsed line onto a `struct lxc_conf` field, reimplemented here as a
//! match over the key's dot-separated head.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct InetAddr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
    pub bcast: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
pub struct Inet6Addr {
    pub addr: Ipv6Addr,
    pub prefix: u8,
}

#[derive(Debug, Clone, Default)]
pub struct NetConfCommon {
    pub flags_up: bool,
    /// `lxc.network.link`. Meaning depends on the network type: for `veth`
    /// it is the bridge the host-side end is enslaved to after creation
    /// (`network::bridge_attach`); for `macvlan` it is the master device
    /// the new interface shares a link with; for `phys` it is the physical
    /// device handed over to the container outright.
    pub link: Option<String>,
    pub name: Option<String>,
    pub hwaddr: Option<[u8; 6]>,
    pub mtu: Option<u32>,
    pub ipv4: Vec<InetAddr>,
    pub ipv6: Vec<Inet6Addr>,
}

#[derive(Debug, Clone)]
pub enum NetConf {
    Empty(NetConfCommon),
    Veth(NetConfCommon),
    Macvlan(NetConfCommon),
    Phys(NetConfCommon),
}

impl NetConf {
    fn common_mut(&mut self) -> &mut NetConfCommon {
        match self {
            NetConf::Empty(c) | NetConf::Veth(c) | NetConf::Macvlan(c) | NetConf::Phys(c) => c,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Conf {
    pub rootfs: Option<PathBuf>,
    pub utsname: Option<String>,
    pub tty_count: u32,
    pub networks: Vec<NetConf>,
    pub mounts: Vec<String>,
    pub cgroup_settings: Vec<(String, String)>,
    pub cap_drop: Vec<String>,
    /// Whether the launch should unshare a user namespace
    /// (`lxc.userns = 1`). Off by default, matching `CLONE_NEWUSER` being
    /// the one optional bit in spec.md §4.D's clone-flag bitmask.
    pub newuserns: bool,
}

impl Conf {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let mut conf = Conf::default();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("line {}: expected 'key = value'", lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();
            conf.apply(key, value)
                .map_err(|e| Error::Config(format!("line {}: {e}", lineno + 1)))?;
        }
        Ok(conf)
    }

    fn apply(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        if let Some(rest) = key.strip_prefix("lxc.cgroup.") {
            self.cgroup_settings.push((rest.to_owned(), value.to_owned()));
            return Ok(());
        }
        match key {
            "lxc.utsname" => self.utsname = Some(value.to_owned()),
            "lxc.rootfs" => self.rootfs = Some(PathBuf::from(value)),
            "lxc.mount" => self.mounts.push(value.to_owned()),
            "lxc.cap.drop" => {
                self.cap_drop
                    .extend(value.split_whitespace().map(str::to_owned));
            }
            "lxc.userns" => {
                self.newuserns = value != "0";
            }
            "lxc.tty" => {
                self.tty_count = value
                    .parse()
                    .map_err(|_| format!("invalid lxc.tty '{value}'"))?;
            }
            "lxc.network.type" => {
                let common = NetConfCommon::default();
                let net = match value {
                    "empty" => NetConf::Empty(common),
                    "veth" => NetConf::Veth(common),
                    "macvlan" => NetConf::Macvlan(common),
                    "phys" => NetConf::Phys(common),
                    other => return Err(format!("unknown lxc.network.type '{other}'")),
                };
                self.networks.push(net);
            }
            "lxc.network.flags" => {
                let net = self.last_network_mut()?;
                net.common_mut().flags_up = value == "up";
            }
            "lxc.network.link" => self.last_network_mut()?.common_mut().link = Some(value.to_owned()),
            "lxc.network.name" => self.last_network_mut()?.common_mut().name = Some(value.to_owned()),
            "lxc.network.hwaddr" => {
                let mac = crate::network::convert_mac(value)
                    .map_err(|_| format!("invalid lxc.network.hwaddr '{value}'"))?;
                self.last_network_mut()?.common_mut().hwaddr = Some(mac);
            }
            "lxc.network.mtu" => {
                let mtu: u32 = value
                    .parse()
                    .map_err(|_| format!("invalid lxc.network.mtu '{value}'"))?;
                self.last_network_mut()?.common_mut().mtu = Some(mtu);
            }
            "lxc.network.ipv4" => {
                let inet = parse_inet4(value)?;
                self.last_network_mut()?.common_mut().ipv4.push(inet);
            }
            "lxc.network.ipv6" => {
                let inet = parse_inet6(value)?;
                self.last_network_mut()?.common_mut().ipv6.push(inet);
            }
            other => return Err(format!("unrecognised key '{other}'")),
        }
        Ok(())
    }

    fn last_network_mut(&mut self) -> std::result::Result<&mut NetConf, String> {
        self.networks
            .last_mut()
            .ok_or_else(|| "network option given before lxc.network.type".to_owned())
    }
}

fn parse_inet4(value: &str) -> std::result::Result<InetAddr, String> {
    let mut parts = value.split_whitespace();
    let addr_prefix = parts.next().ok_or("missing address/prefix")?;
    let bcast = parts
        .next()
        .map(|b| b.parse::<Ipv4Addr>().map_err(|_| "invalid broadcast address".to_owned()))
        .transpose()?;
    let (addr, prefix) = addr_prefix
        .split_once('/')
        .ok_or("expected addr/prefix")?;
    Ok(InetAddr {
        addr: addr.parse().map_err(|_| "invalid ipv4 address".to_owned())?,
        prefix: prefix.parse().map_err(|_| "invalid prefix length".to_owned())?,
        bcast,
    })
}

fn parse_inet6(value: &str) -> std::result::Result<Inet6Addr, String> {
    let addr_prefix = value.split_whitespace().next().ok_or("missing address/prefix")?;
    let (addr, prefix) = addr_prefix
        .split_once('/')
        .ok_or("expected addr/prefix")?;
    Ok(Inet6Addr {
        addr: addr.parse().map_err(|_| "invalid ipv6 address".to_owned())?,
        prefix: prefix.parse().map_err(|_| "invalid prefix length".to_owned())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_keys() {
        let conf = Conf::from_str(
            "lxc.utsname = box\n# a comment\n\nlxc.rootfs = /var/lib/lxc/box/rootfs\n",
        )
        .unwrap();
        assert_eq!(conf.utsname.as_deref(), Some("box"));
        assert_eq!(conf.rootfs, Some(PathBuf::from("/var/lib/lxc/box/rootfs")));
    }

    #[test]
    fn parses_network_block() {
        let conf = Conf::from_str(
            "lxc.network.type = veth\nlxc.network.flags = up\nlxc.network.link = lxcbr0\nlxc.network.name = eth0\nlxc.network.ipv4 = 10.0.3.5/24 10.0.3.255\n",
        )
        .unwrap();
        assert_eq!(conf.networks.len(), 1);
        match &conf.networks[0] {
            NetConf::Veth(c) => {
                assert!(c.flags_up);
                assert_eq!(c.link.as_deref(), Some("lxcbr0"));
                assert_eq!(c.name.as_deref(), Some("eth0"));
                assert_eq!(c.ipv4.len(), 1);
                assert_eq!(c.ipv4[0].addr, Ipv4Addr::new(10, 0, 3, 5));
                assert_eq!(c.ipv4[0].prefix, 24);
            }
            _ => panic!("expected veth network"),
        }
    }

    #[test]
    fn network_option_without_type_is_an_error() {
        assert!(Conf::from_str("lxc.network.link = lxcbr0\n").is_err());
    }

    #[test]
    fn userns_and_tty_count() {
        let conf = Conf::from_str("lxc.userns = 1\nlxc.tty = 4\n").unwrap();
        assert!(conf.newuserns);
        assert_eq!(conf.tty_count, 4);
    }

    #[test]
    fn cgroup_dotted_keys() {
        let conf = Conf::from_str("lxc.cgroup.memory.limit_in_bytes = 100000000\n").unwrap();
        assert_eq!(
            conf.cgroup_settings,
            vec![("memory.limit_in_bytes".to_owned(), "100000000".to_owned())]
        );
    }
}
