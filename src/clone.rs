//! Namespace-flag clone wrapper.
//!
//! Prefers the raw `clone3(2)` syscall (gives us `CLONE_INTO_CGROUP` for
//! free); falls back to `unshare(2)` + `fork(2)` when the kernel doesn't
//! have `clone3` (`ENOSYS`, e.g. under some seccomp filters or very old
//! kernels).

use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::unistd::{fork, ForkResult, Pid};

#[repr(C, align(8))]
#[derive(Debug, Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

pub enum Clone {
    Child,
    Parent(Pid),
}

/// Namespace and miscellaneous clone flags a launch may request, plus an
/// optional cgroup fd to atomically place the child into (`clone3` only;
/// ignored on the `unshare`+`fork` fallback, where the caller must join the
/// cgroup itself after fork).
#[derive(Debug, Clone, Copy, Default)]
pub struct LaunchFlags {
    pub newuts: bool,
    pub newpid: bool,
    pub newipc: bool,
    pub newns: bool,
    pub newnet: bool,
    pub newuser: bool,
}

impl LaunchFlags {
    fn to_clone_flags(self) -> CloneFlags {
        let mut f = CloneFlags::empty();
        if self.newuts {
            f |= CloneFlags::CLONE_NEWUTS;
        }
        if self.newpid {
            f |= CloneFlags::CLONE_NEWPID;
        }
        if self.newipc {
            f |= CloneFlags::CLONE_NEWIPC;
        }
        if self.newns {
            f |= CloneFlags::CLONE_NEWNS;
        }
        if self.newnet {
            f |= CloneFlags::CLONE_NEWNET;
        }
        if self.newuser {
            f |= CloneFlags::CLONE_NEWUSER;
        }
        f
    }

    fn to_raw(self) -> u64 {
        self.to_clone_flags().bits() as u64
    }
}

unsafe fn raw_clone3(cl_args: &CloneArgs) -> Result<Clone, Errno> {
    let res = nix::libc::syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => Clone::Child,
        v => Clone::Parent(Pid::from_raw(v as nix::libc::pid_t)),
    })
}

/// Forks a child into the requested namespaces. On kernels without
/// `clone3`, `into_cgroup` is ignored; the caller is responsible for
/// writing the child's pid into `cgroup.procs` itself in that case.
pub fn clone_into_namespaces<T: AsRawFd>(
    flags: LaunchFlags,
    into_cgroup: Option<&T>,
) -> Result<Clone, Errno> {
    let mut args = CloneArgs {
        flags: flags.to_raw(),
        exit_signal: nix::libc::SIGCHLD as u64,
        ..Default::default()
    };
    if let Some(cgroup) = into_cgroup {
        args.flags |= nix::libc::CLONE_INTO_CGROUP as u64;
        args.cgroup = cgroup.as_raw_fd() as u64;
    }
    match unsafe { raw_clone3(&args) } {
        Err(Errno::ENOSYS) => clone_via_unshare_fork(flags),
        other => other,
    }
}

/// `unshare(CLONE_NEWPID)` only takes effect for the caller's *next* fork,
/// not the caller itself, so this fallback needs one extra generation: an
/// intermediate process unshares then forks the real child (which lands as
/// pid 1 of the new pid namespace), waits for it, and exits with its status
/// so the original caller still only ever waits on one pid.
fn clone_via_unshare_fork(flags: LaunchFlags) -> Result<Clone, Errno> {
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(Clone::Parent(child)),
        ForkResult::Child => {
            nix::sched::unshare(flags.to_clone_flags())?;
            match unsafe { fork() } {
                Ok(ForkResult::Child) => Ok(Clone::Child),
                Ok(ForkResult::Parent { child }) => {
                    let status = nix::sys::wait::waitpid(child, None)
                        .map(|status| match status {
                            nix::sys::wait::WaitStatus::Exited(_, code) => code,
                            nix::sys::wait::WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
                            _ => 1,
                        })
                        .unwrap_or(1);
                    std::process::exit(status);
                }
                Err(_) => std::process::exit(1),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_composition() {
        let flags = LaunchFlags {
            newuts: true,
            newpid: true,
            newipc: true,
            newns: true,
            newnet: true,
            newuser: false,
        };
        let bits = flags.to_clone_flags();
        assert!(bits.contains(CloneFlags::CLONE_NEWUTS));
        assert!(bits.contains(CloneFlags::CLONE_NEWPID));
        assert!(!bits.contains(CloneFlags::CLONE_NEWUSER));
    }
}
