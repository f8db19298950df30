//! Mount-namespace setup performed by the child between unshare and
//! `execve`: makes the mount tree private, lays down the base virtual
//! filesystems, applies any extra bind mounts named in the container's
//! mount table, then pivots into the new root (when one is configured).

use std::fs::create_dir;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::fchdir;

use crate::error::{Error, Result};

fn ignore_kind(result: std::io::Result<()>, kind: ErrorKind) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == kind => Ok(()),
        other => other,
    }
}

/// One line of the container's `mount` table file: a plain bind mount from
/// a host path to a path inside the new root.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// Parses the `lxc.mount` table file: one `source target` pair per
/// non-empty, non-comment line.
pub fn parse_mount_table(text: &str) -> Result<Vec<MountEntry>> {
    let mut entries = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let source = parts.next();
        let target = parts.next();
        match (source, target) {
            (Some(s), Some(t)) => entries.push(MountEntry {
                source: PathBuf::from(s),
                target: PathBuf::from(t),
            }),
            _ => {
                return Err(Error::Config(format!(
                    "mount table line {}: expected 'source target'",
                    lineno + 1
                )))
            }
        }
    }
    Ok(entries)
}

fn setup_mount(
    rootfs: &Path,
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    let target = rootfs.join(target.trim_start_matches('/'));
    ignore_kind(create_dir(&target), ErrorKind::AlreadyExists)?;
    mount(Some(source), &target, Some(fstype), flags, data)?;
    Ok(())
}

fn base_mounts(rootfs: &Path) -> Result<()> {
    setup_mount(
        rootfs,
        "sysfs",
        "/sys",
        "sysfs",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
        None,
    )?;
    setup_mount(
        rootfs,
        "proc",
        "/proc",
        "proc",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )?;
    setup_mount(
        rootfs,
        "tmpfs",
        "/dev",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755,size=65536k"),
    )?;
    setup_mount(
        rootfs,
        "devpts",
        "/dev/pts",
        "devpts",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )?;
    setup_mount(
        rootfs,
        "tmpfs",
        "/dev/shm",
        "tmpfs",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777,size=65536k"),
    )?;
    setup_mount(
        rootfs,
        "mqueue",
        "/dev/mqueue",
        "mqueue",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None,
    )?;
    setup_mount(
        rootfs,
        "cgroup",
        "/sys/fs/cgroup",
        "cgroup2",
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RELATIME,
        None,
    )?;
    Ok(())
}

fn remount_private_root(path: &Path) -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    )?;
    mount(
        Some(path),
        path,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    Ok(())
}

fn pivot_root(path: &Path) -> Result<()> {
    let new_root = open(path, OFlag::O_DIRECTORY | OFlag::O_RDONLY, nix::sys::stat::Mode::empty())?;
    nix::unistd::pivot_root(path, path)?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    umount2("/", MntFlags::MNT_DETACH)?;
    fchdir(&new_root)?;
    Ok(())
}

/// Applies the container's mount moves: private-izes the mount tree,
/// binds any extra mount table entries, lays down the base virtual
/// filesystems, and pivots into `rootfs` if one is configured. With no
/// rootfs the container keeps the host's root and only gets the mount tree
/// privatized plus its extra binds.
pub fn setup_mount_namespace(rootfs: Option<&Path>, extra: &[MountEntry]) -> Result<()> {
    match rootfs {
        Some(rootfs) => {
            remount_private_root(rootfs)?;
            for entry in extra {
                let target = rootfs.join(
                    entry
                        .target
                        .strip_prefix("/")
                        .unwrap_or(entry.target.as_path()),
                );
                ignore_kind(create_dir(&target), ErrorKind::AlreadyExists)?;
                mount(
                    Some(&entry.source),
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )?;
            }
            base_mounts(rootfs)?;
            pivot_root(rootfs)
        }
        None => {
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_SLAVE | MsFlags::MS_REC,
                None::<&str>,
            )?;
            mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_PRIVATE,
                None::<&str>,
            )?;
            for entry in extra {
                mount(
                    Some(&entry.source),
                    &entry.target,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mount_table() {
        let entries = parse_mount_table("# a comment\n/host/data /mnt/data\n\n").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source, PathBuf::from("/host/data"));
        assert_eq!(entries[0].target, PathBuf::from("/mnt/data"));
    }

    #[test]
    fn rejects_malformed_line() {
        assert!(parse_mount_table("/only/source\n").is_err());
    }
}
