pub mod cgroup;
pub mod clone;
pub mod config;
pub mod console;
pub mod container;
pub mod error;
mod ioutil;
pub mod mounts;
pub mod netlink;
pub mod network;
pub mod ptyserver;
pub mod sync;
pub mod tty;
pub mod userns;

mod handler;

pub use cgroup::Cgroup;
pub use config::{Conf, Inet6Addr, InetAddr, NetConf, NetConfCommon};
pub use container::{base_path, Container, DEFAULT_LXCPATH};
pub use error::{Error, NetError, Result, SyncError};
pub use handler::{Handler, State};
