//! User-namespace id mapping.
//!
//! Makes the optional `CLONE_NEWUSER` flag usable without the launcher
//! itself running fully privileged: after the child has unshared into a new
//! user namespace, the parent writes a single-entry identity map into
//! `/proc/<pid>/{uid_map,gid_map}`, mapping the invoking user's own uid/gid
//! to uid 0/gid 0 inside the container. Scoped to that one case; no
//! sub-uid/sub-gid ranges, no `newuidmap`/`newgidmap` shellouts.

use std::fs::OpenOptions;
use std::io::Write as _;

use nix::unistd::Pid;

use crate::error::{Error, Result};

/// A single contiguous id range mapped from the host into the container.
#[derive(Clone, Copy, Debug)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    pub fn root(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }

    fn write(self, path: &str) -> Result<()> {
        let line = format!("{} {} {}\n", self.container_id, self.host_id, self.size);
        OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(Error::Io)?
            .write_all(line.as_bytes())
            .map_err(Error::Io)
    }
}

/// Maps the calling process's own uid/gid as the container's root identity
/// inside `pid`'s (already-unshared) user namespace.
///
/// Must be called from the parent after the child has returned from
/// `unshare(CLONE_NEWUSER)` but before the child proceeds past that
/// barrier; the kernel refuses to write these files until then. `setgroups`
/// is denied first, the way the kernel requires before an unprivileged
/// single-entry gid_map write is accepted.
pub fn map_current_user_as_root(pid: Pid) -> Result<()> {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();
    deny_setgroups(pid)?;
    IdMap::root(uid.as_raw()).write(&format!("/proc/{pid}/uid_map"))?;
    IdMap::root(gid.as_raw()).write(&format!("/proc/{pid}/gid_map"))?;
    Ok(())
}

fn deny_setgroups(pid: Pid) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .open(format!("/proc/{pid}/setgroups"))
        .map_err(Error::Io)?
        .write_all(b"deny")
        .map_err(Error::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_map_has_single_entry() {
        let m = IdMap::root(1000);
        assert_eq!(m.container_id, 0);
        assert_eq!(m.host_id, 1000);
        assert_eq!(m.size, 1);
    }
}
