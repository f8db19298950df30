//! Single-purpose cgroup v2 handle: resolve the caller's current cgroup,
//! descend into a named child, and attach a pid to it by writing
//! `cgroup.procs`. No controller configuration beyond that is exposed.

use std::fs::{create_dir_all, read, remove_dir, File};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct Cgroup {
    mount_path: PathBuf,
    path: PathBuf,
}

const PROC_CGROUP: &str = "/proc/self/cgroup";
const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const CGROUP_PROCS: &str = "cgroup.procs";

impl Cgroup {
    pub fn new(mount_path: impl Into<PathBuf>, name: impl AsRef<Path>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_absolute() {
            return Err(Error::Config("cgroup name cannot be absolute".into()));
        }
        let mount_path = mount_path.into();
        if !mount_path.is_absolute() {
            return Err(Error::Config("cgroup mount path must be absolute".into()));
        }
        let path = mount_path.join(name);
        Ok(Self { mount_path, path })
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &Path {
        self.path
            .strip_prefix(&self.mount_path)
            .expect("cgroup path does not start with mount path")
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Resolves the calling process's own cgroup v2 membership from
    /// `/proc/self/cgroup`'s unified entry (empty controller list field).
    pub fn current() -> Result<Self> {
        let contents = read(PROC_CGROUP)?;
        let text = String::from_utf8_lossy(&contents);
        for line in text.split('\n') {
            let parts: Vec<_> = line.split(':').collect();
            if let Some(v) = parts.get(1) {
                if !v.is_empty() {
                    continue;
                }
            }
            let cgroup = parts
                .get(2)
                .ok_or_else(|| Error::Config("expected a cgroup path".into()))?
                .trim_start_matches('/');
            return Cgroup::new(CGROUP_MOUNT, cgroup);
        }
        Err(Error::Config("cannot resolve own cgroup".into()))
    }

    pub fn parent(&self) -> Option<Self> {
        let path = self.path.parent()?;
        if path.starts_with(&self.mount_path) {
            Some(Self {
                mount_path: self.mount_path.clone(),
                path: path.to_owned(),
            })
        } else {
            None
        }
    }

    pub fn child(&self, name: impl AsRef<Path>) -> Result<Self> {
        let name = name.as_ref();
        if name.is_absolute() {
            return Err(Error::Config("child cgroup name cannot be absolute".into()));
        }
        Ok(Self {
            mount_path: self.mount_path.clone(),
            path: self.path.join(name),
        })
    }

    pub fn create(&self) -> Result<()> {
        create_dir_all(&self.path)?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        remove_dir(&self.path)?;
        Ok(())
    }

    pub fn add_process(&self, pid: Pid) -> Result<()> {
        File::options()
            .write(true)
            .open(self.path.join(CGROUP_PROCS))?
            .write_all(pid.to_string().as_bytes())?;
        Ok(())
    }

    pub fn open(&self) -> Result<File> {
        Ok(File::options()
            .read(true)
            .custom_flags(nix::libc::O_PATH | nix::libc::O_DIRECTORY)
            .open(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_absolute_name() {
        assert!(Cgroup::new(CGROUP_MOUNT, "/abs").is_err());
    }

    #[test]
    fn child_joins_relative_path() {
        let root = Cgroup::new(CGROUP_MOUNT, "lxc").unwrap();
        let child = root.child("mycontainer").unwrap();
        assert_eq!(child.name(), Path::new("lxc/mycontainer"));
    }
}
